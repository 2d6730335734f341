use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use tempfile::TempDir;

use grail_access::config::{Config, ProxiesConfig};
use grail_access::fetch::{FetchError, fetch_all};
use grail_access::protocols::{
    AccessError, DataHandler, HeadersMap, Meta, PollStatus, ProtocolAccess, Request,
    SchemeHandler, SchemeRegistry, Stage, Target, expect_stage,
};
use grail_access::proxy::seed_from_env;
use grail_access::ProtocolApi;

/// Bookkeeping shared between a `mem:` handler and its sessions
#[derive(Default)]
struct Tracker {
    opened: RefCell<Vec<String>>,
    open_now: Cell<usize>,
    max_open: Cell<usize>,
}

struct MemHandler(Rc<Tracker>);

impl SchemeHandler for MemHandler {
    fn scheme(&self) -> &str {
        "mem"
    }

    fn open(
        &self,
        target: Target,
        _request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        let Target::Direct(rest) = target else {
            return Err(AccessError::Malformed("mem: is never proxied".into()));
        };
        let tracker = &self.0;
        tracker.opened.borrow_mut().push(rest.clone());
        tracker.open_now.set(tracker.open_now.get() + 1);
        tracker.max_open.set(tracker.max_open.get().max(tracker.open_now.get()));

        Ok(Box::new(MemAccess {
            tracker: Rc::clone(tracker),
            stage: Stage::Meta,
            body: Bytes::from(format!("body of {rest}")),
            waits: 1,
            closed: false,
        }))
    }
}

/// Reports "not ready" once per stage before answering
struct MemAccess {
    tracker: Rc<Tracker>,
    stage: Stage,
    body: Bytes,
    waits: u8,
    closed: bool,
}

impl MemAccess {
    fn poll(&mut self) -> PollStatus {
        if self.waits > 0 {
            self.waits -= 1;
            PollStatus::waiting("Connecting")
        } else {
            PollStatus::ready()
        }
    }
}

impl ProtocolAccess for MemAccess {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn pollmeta(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "pollmeta")?;
        Ok(self.poll())
    }

    fn getmeta(&mut self) -> Result<Meta, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "getmeta")?;
        self.stage = Stage::Data;
        self.waits = 1;
        Ok(Meta {
            status: 200,
            reason: "Ready".into(),
            headers: HeadersMap::from([("content-length".into(), self.body.len().to_string())]),
        })
    }

    fn polldata(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "polldata")?;
        Ok(self.poll())
    }

    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "getdata")?;
        let chunk = self.body.split_to(max_bytes.min(self.body.len()));
        if chunk.is_empty() {
            self.stage = Stage::Done;
        }
        Ok(chunk)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tracker.open_now.set(self.tracker.open_now.get() - 1);
        }
        self.stage = Stage::Done;
    }
}

fn api_with_mem(sockets: usize) -> (ProtocolApi, Rc<Tracker>) {
    let tracker = Rc::new(Tracker::default());
    let mut registry = SchemeRegistry::new();
    registry.register("mem", Rc::new(MemHandler(Rc::clone(&tracker))));
    registry.register("data", Rc::new(DataHandler));
    (ProtocolApi::new(registry, ProxiesConfig::default(), sockets), tracker)
}

#[test]
fn test_fetch_all_respects_socket_limit_and_fifo() {
    let (mut api, tracker) = api_with_mem(2);
    let requests: Vec<Request> = (1..=5).map(|i| Request::get(format!("mem:{i}"))).collect();

    let results = fetch_all(&mut api, &requests, 3);

    for (i, result) in results.iter().enumerate() {
        let fetched = result.as_ref().unwrap();
        assert_eq!(fetched.meta.status, 200);
        assert_eq!(fetched.body, Bytes::from(format!("body of {}", i + 1)));
    }
    assert_eq!(*tracker.opened.borrow(), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(tracker.max_open.get(), 2);
    assert_eq!(tracker.open_now.get(), 0);
    assert_eq!(api.sockets().open_count(), 0);
    assert_eq!(api.sockets().queued_len(), 0);
}

#[test]
fn test_fetch_all_keeps_request_order_with_failures() {
    let (mut api, _) = api_with_mem(1);
    let requests = vec![
        Request::get("data:,hello"),
        Request::get("gopher://old.example/"),
        Request::get("data:text/plain;base64,aGk="),
    ];

    let results = fetch_all(&mut api, &requests, 2);

    assert_eq!(&results[0].as_ref().unwrap().body[..], b"hello");
    assert!(matches!(
        results[1],
        Err(FetchError::Access { source: AccessError::NoHandler(_), .. })
    ));
    assert_eq!(&results[2].as_ref().unwrap().body[..], b"hi");
    assert_eq!(api.sockets().open_count(), 0);

    let snapshot = api.metrics().snapshot();
    assert_eq!((snapshot.sessions_opened, snapshot.sessions_failed), (2, 1));
    assert_eq!(snapshot.bytes_delivered, 7);
}

#[test]
fn test_zero_sockets_starves_every_request() {
    let (mut api, tracker) = api_with_mem(0);
    let requests = vec![Request::get("mem:a"), Request::get("mem:b")];

    let results = fetch_all(&mut api, &requests, 8);

    assert!(results.iter().all(|r| matches!(r, Err(FetchError::Starved { .. }))));
    assert!(tracker.opened.borrow().is_empty());
    assert_eq!(api.sockets().queued_len(), 0);
}

#[test]
fn test_data_session_through_api() {
    let (api, _) = api_with_mem(1);
    let mut session = api
        .protocol_access(&Request::get("data:text/html,%3Cb%3Ehi%3C%2Fb%3E"))
        .unwrap();

    let meta = session.getmeta().unwrap();
    assert_eq!(meta.header("content-type"), Some("text/html"));
    assert_eq!(&session.getdata(64).unwrap()[..], b"<b>hi</b>");
    assert!(session.getdata(64).unwrap().is_empty());
    assert_eq!(session.stage(), Stage::Done);
}

#[test]
fn test_route_from_config() {
    let mut config = Config::default();
    config.proxies.manual_proxy_enabled = Some(true);
    config.proxies.no_proxy_enabled = Some(true);
    config.proxies.no_proxy = Some("localhost".into());
    config.proxies.set_proxy("ftp", "http://cache.local:3128");
    let api = ProtocolApi::from_config(&config);

    let decision = api.route("ftp://ftp.gnu.org/gnu/").unwrap();
    assert!(decision.use_proxy);
    assert_eq!(decision.dispatch_scheme, "http");
    let json = serde_json::to_value(&decision).unwrap();
    assert_eq!(json["proxy_target"], "cache.local:3128");
    assert_eq!(json["original_selector"], "ftp://ftp.gnu.org/gnu/");

    assert!(!api.route("ftp://localhost/pub/").unwrap().use_proxy);
    assert!(matches!(api.route("no-scheme"), Err(AccessError::Malformed(_))));
}

#[test]
fn test_seeding_is_persisted_and_not_repeated() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("prefs").join("grail.toml");

    let mut config = Config::default();
    let seeded = seed_from_env(&mut config.proxies, |name| match name {
        "HTTP_PROXY" => Some("http://proxy.local:8080".to_string()),
        "no_proxy" => Some("localhost, .intra".to_string()),
        _ => None,
    });
    assert!(seeded);
    config.save_to_path(&path).unwrap();

    let mut reloaded = Config::load_from_path(&path).unwrap();
    assert_eq!(reloaded.proxies.manual_proxy_enabled, Some(true));
    assert_eq!(reloaded.proxies.proxy_for("http"), Some("http://proxy.local:8080"));
    assert_eq!(reloaded.proxies.no_proxy_list(), vec!["localhost", ".intra"]);

    assert!(!seed_from_env(&mut reloaded.proxies, |_| Some("http://other:1".to_string())));
    assert_eq!(reloaded.proxies.proxy_for("http"), Some("http://proxy.local:8080"));
}

#[test]
fn test_apply_config_admits_waiters() {
    let (mut api, _) = api_with_mem(1);
    let admitted = Rc::new(Cell::new(0));
    let sockets = api.sockets_mut();
    for _ in 0..3 {
        let admitted = Rc::clone(&admitted);
        sockets.request_slot(
            Default::default(),
            Box::new(move || admitted.set(admitted.get() + 1)),
        );
    }
    assert_eq!(admitted.get(), 1);

    let mut config = Config::default();
    config.sockets.number = 3;
    assert_eq!(api.apply_config(&config), 2);
    assert_eq!(admitted.get(), 3);
}

/// Accept one connection, answer with `response`, send back the request head.
fn fake_proxy(response: &'static str) -> (String, mpsc::Receiver<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut head = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            head.push(line);
        }
        stream.write_all(response.as_bytes()).unwrap();
        tx.send(head).unwrap();
    });

    (addr, rx)
}

#[test]
fn test_ftp_url_is_relayed_through_http_proxy() {
    let (proxy, rx) = fake_proxy(
        "HTTP/1.0 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Via: 1.0 cache\r\n\
         \r\n\
         hello via proxy",
    );
    let mut config = Config::default();
    config.proxies.manual_proxy_enabled = Some(true);
    config.proxies.set_proxy("ftp", format!("http://{proxy}"));
    let api = ProtocolApi::from_config(&config);

    let mut session = api
        .protocol_access(&Request::get("ftp://ftp.example.com/pub/a.txt"))
        .unwrap();
    let meta = session.getmeta().unwrap();
    assert_eq!((meta.status, meta.reason.as_str()), (200, "OK"));
    assert_eq!(meta.header("content-type"), Some("text/plain"));
    assert_eq!(meta.header("via"), Some("1.0 cache"));

    let mut body = Vec::new();
    loop {
        let chunk = session.getdata(5).unwrap();
        if chunk.is_empty() {
            break;
        }
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, b"hello via proxy");
    assert_eq!(session.stage(), Stage::Done);

    let head = rx.recv().unwrap();
    assert_eq!(head[0], "GET ftp://ftp.example.com/pub/a.txt HTTP/1.0");
    assert!(head.contains(&"Host: ftp.example.com".to_string()));
    assert_eq!(api.metrics().snapshot().sessions_proxied, 1);
}
