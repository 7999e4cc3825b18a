use std::cell::Cell;
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fanout::{
    subscriber, AuthKey, Broker, BrokerAddr, BrokerConfig, Error, NetPubSub, Payload, Result,
    Subscriber,
};

struct TestBroker {
    addr: BrokerAddr,
    key: AuthKey,
    stop: fanout::StopHandle,
    join: Option<JoinHandle<Result<()>>>,
}

impl TestBroker {
    fn start() -> TestBroker {
        let _ = env_logger::builder().is_test(true).try_init();
        let key = AuthKey::generate();
        let broker = Broker::bind(BrokerConfig::default(), key.clone()).unwrap();
        let addr = broker.address().clone();
        let stop = broker.stop_handle();
        let join = thread::spawn(move || broker.start());
        TestBroker {
            addr,
            key,
            stop,
            join: Some(join),
        }
    }

    fn endpoint(&self) -> NetPubSub {
        NetPubSub::new(self.addr.clone(), self.key.clone())
    }

    fn connected_endpoint(&self) -> NetPubSub {
        let endpoint = self.endpoint();
        endpoint.connect().unwrap();
        endpoint
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn counter(endpoint: &NetPubSub, topic: impl Into<fanout::Topic>) -> (Rc<Cell<usize>>, Subscriber) {
    let count = Rc::new(Cell::new(0));
    let inner = Rc::clone(&count);
    let sub = subscriber(move |_topic, _payload| {
        inner.set(inner.get() + 1);
        Ok(())
    });
    endpoint.add_subscriber(topic, &sub);
    (count, sub)
}

/// Polls `endpoint` until `done` holds or `timeout` passes.
fn drive(endpoint: &NetPubSub, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        let _ = endpoint.poll(Some(Duration::from_millis(50)));
    }
    true
}

const LONG: Duration = Duration::from_secs(5);
const SHORT: Duration = Duration::from_millis(300);

#[test]
fn fan_out_reaches_every_other_endpoint_exactly_once() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = broker.connected_endpoint();
    let c = broker.connected_endpoint();
    let (a_count, _a_sub) = counter(&a, "d");
    let (b_count, _b_sub) = counter(&b, "d");
    let (c_count, _c_sub) = counter(&c, "d");

    a.publish("d", Payload::new().with("i", 1));

    // Local delivery on the publisher happens immediately and only once.
    assert_eq!(a_count.get(), 1);

    assert!(drive(&b, LONG, || b_count.get() >= 1));
    assert!(drive(&c, LONG, || c_count.get() >= 1));

    // The broker must not reflect the message back to its publisher, and
    // nobody may see it twice.
    drive(&a, SHORT, || false);
    assert_eq!(a_count.get(), 1);
    assert_eq!(b_count.get(), 1);
    assert_eq!(c_count.get(), 1);
}

#[test]
fn local_suffix_never_traverses_the_broker() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = broker.connected_endpoint();
    let (a_count, _a_sub) = counter(&a, "d");
    let (b_count, _b_sub) = counter(&b, "d");

    a.publish(["d", fanout::LOCAL_SUFFIX], Payload::new().with("i", 1));
    assert_eq!(a_count.get(), 1);
    assert!(!drive(&b, SHORT, || b_count.get() > 0));

    // The channel itself works: a plain publication still goes through.
    a.publish("d", Payload::new().with("i", 2));
    assert!(drive(&b, LONG, || b_count.get() == 1));
    assert_eq!(a_count.get(), 2);
}

#[test]
fn messages_from_one_source_arrive_in_publication_order() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = broker.connected_endpoint();

    let received = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sub = {
        let received = Rc::clone(&received);
        subscriber(move |_topic, payload: &Payload| {
            received.borrow_mut().push(payload.get_as::<u64>("n")?);
            Ok(())
        })
    };
    b.add_subscriber("seq", &sub);

    for n in 0..20u64 {
        a.publish("seq", Payload::new().with("n", n));
    }

    assert!(drive(&b, LONG, || received.borrow().len() >= 20));
    assert_eq!(*received.borrow(), (0..20).collect::<Vec<u64>>());
}

#[test]
fn lifecycle_guards() {
    let broker = TestBroker::start();
    let endpoint = broker.endpoint();

    assert!(matches!(endpoint.poll(None), Err(Error::NotConnected)));
    assert!(matches!(endpoint.disconnect(), Err(Error::NotConnected)));

    endpoint.connect().unwrap();
    assert!(matches!(endpoint.connect(), Err(Error::AlreadyConnected)));
    assert!(matches!(
        endpoint.set_broker(broker.addr.clone(), broker.key.clone()),
        Err(Error::AlreadyConnected)
    ));

    endpoint.disconnect().unwrap();
    assert!(matches!(endpoint.disconnect(), Err(Error::NotConnected)));
    endpoint
        .set_broker(broker.addr.clone(), broker.key.clone())
        .unwrap();
}

#[test]
fn disconnected_endpoint_still_serves_local_subscribers() {
    let broker = TestBroker::start();
    let endpoint = broker.endpoint();
    let (count, _sub) = counter(&endpoint, "t");

    endpoint.publish("t", Payload::new().with("i", 1));
    assert_eq!(count.get(), 1);
}

#[test]
fn one_endpoint_leaving_does_not_disturb_the_rest() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = broker.connected_endpoint();
    let c = broker.connected_endpoint();
    let (c_count, _c_sub) = counter(&c, "t");

    b.disconnect().unwrap();
    a.publish("t", Payload::new().with("i", 1));

    assert!(drive(&c, LONG, || c_count.get() >= 1));
    assert_eq!(c_count.get(), 1);
}

#[test]
fn wrong_key_is_rejected_without_disturbing_other_clients() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = broker.connected_endpoint();
    let (b_count, _b_sub) = counter(&b, "t");

    let impostor = NetPubSub::new(broker.addr.clone(), AuthKey::generate());
    assert!(matches!(impostor.connect(), Err(Error::Auth(_))));
    assert!(!impostor.is_connected());

    a.publish("t", Payload::new().with("i", 1));
    assert!(drive(&b, LONG, || b_count.get() >= 1));
}

#[test]
fn clean_shutdown_joins_the_forwarder_and_closes_clients() {
    let mut broker = TestBroker::start();
    let endpoint = broker.connected_endpoint();

    broker.stop.stop();
    let join = broker.join.take().unwrap();
    join.join().unwrap().unwrap();

    // The forwarder closed our connection on the way out.
    let deadline = Instant::now() + LONG;
    loop {
        match endpoint.poll(Some(Duration::from_millis(50))) {
            Err(Error::Disconnected) => break,
            Err(err) => panic!("unexpected poll error: {err}"),
            Ok(_) => assert!(Instant::now() < deadline, "connection never closed"),
        }
    }
    assert!(!endpoint.is_connected());
}

#[test]
fn broker_file_round_trip_connects() {
    let dir = tempfile::tempdir().unwrap();
    #[cfg(unix)]
    let addr = BrokerAddr::Unix(dir.path().join("broker.sock"));
    #[cfg(not(unix))]
    let addr = BrokerAddr::Tcp("127.0.0.1:0".parse().unwrap());
    let key = AuthKey::generate();
    let config = BrokerConfig {
        address: Some(addr),
        ..Default::default()
    };
    let broker = Broker::bind(config, key.clone()).unwrap();

    let file = dir.path().join("broker.json");
    fanout::write_broker_file(&file, broker.address(), &key, false).unwrap();

    // A second write without the overwrite flag must refuse.
    assert!(matches!(
        fanout::write_broker_file(&file, broker.address(), &key, false),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists
    ));
    fanout::write_broker_file(&file, broker.address(), &key, true).unwrap();

    let (loaded_addr, loaded_key) = fanout::read_broker_file(&file).unwrap();
    assert_eq!(&loaded_addr, broker.address());
    assert_eq!(loaded_key, key);

    let stop = broker.stop_handle();
    let join = thread::spawn(move || broker.start());

    // The loaded pair is everything an endpoint needs.
    let endpoint = NetPubSub::new(loaded_addr, loaded_key);
    endpoint.connect().unwrap();
    let (count, _sub) = counter(&endpoint, "t");
    endpoint.publish("t", Payload::new().with("i", 1));
    assert_eq!(count.get(), 1);
    endpoint.disconnect().unwrap();

    stop.stop();
    join.join().unwrap().unwrap();
}

#[test]
fn subscriber_reply_reaches_other_endpoints() {
    let broker = TestBroker::start();
    let a = broker.connected_endpoint();
    let b = Rc::new(broker.connected_endpoint());
    let (pong_count, _pong_sub) = counter(&a, "pong");

    // B answers every ping with a pong, published from inside delivery.
    let ping_seen = Rc::new(Cell::new(0));
    let replier = {
        let b = Rc::clone(&b);
        let ping_seen = Rc::clone(&ping_seen);
        subscriber(move |_topic, payload: &Payload| {
            let i = payload.get_as::<u64>("i")?;
            b.publish("pong", Payload::new().with("i", i));
            ping_seen.set(ping_seen.get() + 1);
            Ok(())
        })
    };
    b.add_subscriber("ping", &replier);

    a.publish("ping", Payload::new().with("i", 7));

    assert!(drive(&b, LONG, || ping_seen.get() >= 1));
    assert!(drive(&a, LONG, || pong_count.get() >= 1));
    assert_eq!(pong_count.get(), 1);
}
