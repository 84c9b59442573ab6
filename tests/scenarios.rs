//! End-to-end behaviour of the link service against the mock transport

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rfcomm_link::mock::MockProvider;
use rfcomm_link::{
    BondListener, ConnectionListener, DeviceId, DeviceRecord, DiscoveryListener, Error,
    LinkService, LinkState, Notification, ServiceConfig, ServiceEvent, WriteListener,
};
use tokio::sync::broadcast::error::TryRecvError;

/// Records every callback as a flattened event
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ServiceEvent>>,
}

impl Recorder {
    fn push(&self, event: ServiceEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl DiscoveryListener for Recorder {
    fn on_discovery_started(&self) {
        self.push(ServiceEvent::DiscoveryStarted);
    }

    fn on_discovery_finished(&self) {
        self.push(ServiceEvent::DiscoveryFinished);
    }

    fn on_device_found(&self, record: &DeviceRecord) {
        self.push(ServiceEvent::DeviceFound(record.clone()));
    }
}

impl BondListener for Recorder {
    fn on_device_bonded(&self, device: &DeviceId) {
        self.push(ServiceEvent::Bonded(device.clone()));
    }
}

impl ConnectionListener for Recorder {
    fn on_connection_started(&self, device: &DeviceId) {
        self.push(ServiceEvent::ConnectionStarted(device.clone()));
    }

    fn on_connection_error(&self, device: &DeviceId, error: &Error) {
        self.push(ServiceEvent::ConnectionError {
            device: device.clone(),
            reason: error.to_string(),
        });
    }

    fn on_connection_established(&self, device: &DeviceId) {
        self.push(ServiceEvent::ConnectionEstablished(device.clone()));
    }

    fn on_disconnected(&self, device: &DeviceId) {
        self.push(ServiceEvent::Disconnected(device.clone()));
    }
}

impl WriteListener for Recorder {
    fn on_write_started(&self, device: &DeviceId) {
        self.push(ServiceEvent::WriteStarted(device.clone()));
    }

    fn on_write_finished(&self, device: &DeviceId, bytes: usize) {
        self.push(ServiceEvent::WriteFinished {
            device: device.clone(),
            bytes,
        });
    }

    fn on_write_error(&self, device: &DeviceId, error: &Error) {
        self.push(ServiceEvent::WriteError {
            device: device.clone(),
            reason: error.to_string(),
        });
    }
}

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        keepalive_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn setup(provider: &MockProvider) -> (LinkService, Arc<Recorder>) {
    let service = LinkService::new(Arc::new(provider.clone()), fast_config()).await;
    let recorder = Arc::new(Recorder::default());
    let _ = service.set_discovery_listener(recorder.clone());
    let _ = service.set_bond_listener(recorder.clone());
    let _ = service.set_connection_listener(recorder.clone());
    let _ = service.set_write_listener(recorder.clone());
    (service, recorder)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(n) => seen.push(n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_connect_success_installs_one_channel() {
    let provider = MockProvider::new();
    let (service, recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");

    service.connect(id.clone()).await.unwrap().unwrap();

    assert_eq!(service.connected_devices(), vec![id.clone()]);
    assert_eq!(recorder.count("CONNECTION_STARTED"), 1);
    assert_eq!(recorder.count("CONNECTION_ESTABLISHED"), 1);
    assert_eq!(recorder.count("CONNECTION_ERROR"), 0);
}

#[tokio::test]
async fn test_connection_started_is_synchronous() {
    let provider = MockProvider::new();
    let (service, recorder) = setup(&provider).await;

    let attempt = service.connect(DeviceId::from("AA:BB"));
    assert_eq!(
        recorder.events(),
        vec![ServiceEvent::ConnectionStarted(DeviceId::from("AA:BB"))]
    );
    attempt.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_failure_leaves_no_entry() {
    let provider = MockProvider::new();
    let id = DeviceId::from("AA:BB");
    provider.set_connect_failure(&id, true);
    let (service, recorder) = setup(&provider).await;

    assert!(service.connect(id.clone()).await.unwrap().is_err());

    assert!(!service.is_connected(&id));
    assert_eq!(recorder.count("CONNECTION_ERROR"), 1);
    assert_eq!(recorder.count("CONNECTION_ESTABLISHED"), 0);
    assert_eq!(service.link_state(&id), LinkState::Disconnected);
}

#[tokio::test]
async fn test_monitor_fault_disconnects_without_teardown() {
    let provider = MockProvider::new();
    let (service, recorder) = setup(&provider).await;
    let mut notifications = service.subscribe_notifications();
    let id = DeviceId::from("AA:BB");

    service.connect(id.clone()).await.unwrap().unwrap();
    let monitor = service.monitor(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    provider.last_channel(&id).unwrap().set_fail_writes(true);
    monitor.await.unwrap();

    assert!(!service.is_connected(&id));
    assert!(!service.is_monitoring());
    assert_eq!(recorder.count("DISCONNECTED"), 1);
    assert_eq!(
        drain(&mut notifications),
        vec![
            Notification::Connected(id.clone()),
            Notification::Disconnected(id.clone()),
        ]
    );
}

#[tokio::test]
async fn test_teardown_closes_everything_once() {
    let provider = MockProvider::new();
    let (service, _recorder) = setup(&provider).await;
    let mut notifications = service.subscribe_notifications();
    let ids = [DeviceId::from("AA:BB"), DeviceId::from("CC:DD")];

    let mut monitors = Vec::new();
    for id in &ids {
        service.connect(id.clone()).await.unwrap().unwrap();
        monitors.push(service.monitor(id).unwrap());
    }
    assert!(service.is_monitoring());

    service.teardown().await;
    for monitor in monitors {
        monitor.await.unwrap();
    }

    for id in &ids {
        assert!(provider.last_channel(id).unwrap().is_closed());
        assert!(!service.is_connected(id));
    }
    assert!(service.connected_devices().is_empty());
    assert!(!service.is_monitoring());

    let torn_down = drain(&mut notifications)
        .into_iter()
        .filter(|n| *n == Notification::AllConnectionsTornDown)
        .count();
    assert_eq!(torn_down, 1);
}

#[tokio::test]
async fn test_concurrent_writes_do_not_interleave() {
    let provider = MockProvider::new().with_write_chunk(3);
    let (service, _recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");
    service.connect(id.clone()).await.unwrap().unwrap();

    let first = vec![b'a'; 32];
    let second = vec![b'b'; 32];
    let (r1, r2) = tokio::join!(
        service.write_and_wait(&id, &first),
        service.write_and_wait(&id, &second)
    );
    assert_eq!(r1.unwrap(), 32);
    assert_eq!(r2.unwrap(), 32);

    let written = provider.last_channel(&id).unwrap().written();
    let a_then_b = [first.clone(), second.clone()].concat();
    let b_then_a = [second, first].concat();
    assert!(written == a_then_b || written == b_then_a);
}

#[tokio::test]
async fn test_fire_and_forget_writes_stay_whole() {
    let provider = MockProvider::new().with_write_chunk(2);
    let (service, recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");
    service.connect(id.clone()).await.unwrap().unwrap();

    for text in ["alpha\n", "bravo\n", "charlie\n"] {
        service.write(&id, text.as_bytes().to_vec());
    }
    while recorder.count("WRITE_FINISHED") < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let written = String::from_utf8(provider.last_channel(&id).unwrap().written()).unwrap();
    let mut lines: Vec<&str> = written.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["alpha", "bravo", "charlie"]);
}

#[tokio::test]
async fn test_concurrent_connects_leave_one_channel() {
    let provider = MockProvider::new().with_connect_delay(Duration::from_millis(5));
    let (service, recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");

    let attempts: Vec<_> = (0..8).map(|_| service.connect(id.clone())).collect();
    for attempt in attempts {
        attempt.await.unwrap().unwrap();
    }

    assert_eq!(service.connected_devices().len(), 1);
    let channels = provider.channels(&id);
    assert_eq!(channels.len(), 8);
    assert_eq!(channels.iter().filter(|c| !c.is_closed()).count(), 1);
    assert_eq!(recorder.count("CONNECTION_ESTABLISHED"), 8);

    // The surviving channel is the installed one
    service.write_and_wait(&id, b"x").await.unwrap();
    let open = channels.iter().find(|c| !c.is_closed()).unwrap();
    assert_eq!(open.written(), b"x");
}

#[tokio::test]
async fn test_write_without_channel() {
    let provider = MockProvider::new();
    let (service, recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");

    service.write(&id, b"hello".to_vec());
    assert_eq!(recorder.count("WRITE_ERROR"), 1);
    assert_eq!(recorder.count("WRITE_STARTED"), 0);

    assert!(matches!(
        service.write_and_wait(&id, b"hello").await,
        Err(Error::NotConnected(_))
    ));
    assert_eq!(recorder.count("WRITE_ERROR"), 2);
}

#[tokio::test]
async fn test_recovery_after_disconnect_detected() {
    let provider = MockProvider::new();
    let (service, recorder) = setup(&provider).await;
    let id = DeviceId::from("AA:BB");

    service.connect(id.clone()).await.unwrap().unwrap();
    assert!(service.disconnect_detected(&id).await);
    assert!(!service.is_connected(&id));
    assert_eq!(recorder.count("DISCONNECTED"), 1);

    service.connect(id.clone()).await.unwrap().unwrap();
    assert!(service.is_connected(&id));
    assert_eq!(service.link_state(&id), LinkState::Connected);
    assert_eq!(provider.open_count(&id), 2);
}

#[tokio::test]
async fn test_discovery_dedupe() {
    let provider = MockProvider::new()
        .with_device(DeviceRecord::new("AA:BB", Some("HC-05".into()), Default::default()))
        .with_device(DeviceRecord::new("AA:BB", Some("HC-05 again".into()), Default::default()));
    let (service, recorder) = setup(&provider).await;

    service.discover().await.unwrap();
    service.on_device_found(DeviceRecord::unknown("AA:BB"));

    assert_eq!(service.discovered_devices().len(), 1);
    assert_eq!(recorder.count("DEVICE_FOUND"), 1);
    assert_eq!(recorder.count("DISCOVERY_STARTED"), 1);
    assert_eq!(recorder.count("DISCOVERY_FINISHED"), 1);
}

#[tokio::test]
async fn test_discovery_failure_still_finishes() {
    let provider = MockProvider::new();
    provider.set_discovery_failure(true);
    let (service, recorder) = setup(&provider).await;

    service.discover().await.unwrap();
    assert_eq!(
        recorder.events(),
        vec![ServiceEvent::DiscoveryStarted, ServiceEvent::DiscoveryFinished]
    );
}

#[tokio::test]
async fn test_teardown_with_stalled_write() {
    let provider = MockProvider::new().with_stalled_writes();
    let (service, recorder) = setup(&provider).await;
    let mut notifications = service.subscribe_notifications();
    let id = DeviceId::from("AA:BB");
    service.connect(id.clone()).await.unwrap().unwrap();

    // The peer never drains its buffer, so this write holds the channel
    service.write(&id, b"hello".to_vec());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.count("WRITE_STARTED"), 1);

    let done = tokio::time::timeout(Duration::from_secs(2), service.teardown()).await;
    assert!(done.is_ok());
    assert!(provider.last_channel(&id).unwrap().is_closed());
    assert!(!service.is_connected(&id));

    let torn_down = drain(&mut notifications)
        .into_iter()
        .filter(|n| *n == Notification::AllConnectionsTornDown)
        .count();
    assert_eq!(torn_down, 1);

    while recorder.count("WRITE_ERROR") < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(recorder.count("WRITE_FINISHED"), 0);
}

#[tokio::test]
async fn test_stopping_one_monitor_leaves_others_running() {
    let provider = MockProvider::new();
    let (service, _recorder) = setup(&provider).await;
    let first = DeviceId::from("AA:BB");
    let second = DeviceId::from("CC:DD");

    service.connect(first.clone()).await.unwrap().unwrap();
    service.connect(second.clone()).await.unwrap().unwrap();
    let first_monitor = service.monitor(&first).unwrap();
    let second_monitor = service.monitor(&second).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(service.stop_monitor(&first).unwrap());
    first_monitor.await.unwrap();
    assert_eq!(service.link_state(&first), LinkState::Connected);

    let probes = provider.last_channel(&second).unwrap().written().len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(provider.last_channel(&second).unwrap().written().len() > probes);

    assert!(service.is_monitoring());
    assert_eq!(service.link_state(&second), LinkState::Monitoring);
    assert!(!second_monitor.is_finished());

    service.teardown().await;
    second_monitor.await.unwrap();
}
