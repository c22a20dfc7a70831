/// End-to-end delivery scenarios through the public API.
///
/// Platform "home": node `main` holds the location directory and hosts the
/// sending agent `s`; node `c2` is a second in-process container. Foreign
/// platforms are reached through stub transports.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mts_protocol::{
    AclMessage, AgentId, Authority, ContainerId, DeliveryConfig, DeliveryError, DeliveryOutcome,
    InProcessContainer, LocationDirectory, Mailbox, MessagingService, Mtp, MtpError, NodeSlice,
    Performative, SingleMessage, StaticPlatform,
};
use tokio::sync::mpsc;

const PLATFORM: &str = "home";

struct Fixture {
    svc: Arc<MessagingService>,
    platform: Arc<StaticPlatform>,
    directory: Arc<LocationDirectory<ContainerId>>,
    main: Arc<InProcessContainer>,
    c2: Arc<InProcessContainer>,
    sender: AgentId,
    sender_inbox: Mailbox,
}

impl Fixture {
    async fn new(config: DeliveryConfig) -> Self {
        Self::build(config, None).await
    }

    async fn build(config: DeliveryConfig, authority: Option<Arc<dyn Authority>>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .try_init();

        let directory = Arc::new(LocationDirectory::new());
        let platform = Arc::new(StaticPlatform::with_directory(directory.clone()));
        let main = Arc::new(InProcessContainer::new("main"));
        let c2 = Arc::new(InProcessContainer::new("c2"));
        platform.add_node(main.clone());
        platform.add_node(c2.clone());

        let mut builder = MessagingService::builder(PLATFORM, "main", platform.clone(), main.clone())
            .config(config)
            .directory(directory.clone());
        if let Some(authority) = authority {
            builder = builder.authority(authority);
        }
        let svc = builder.build();

        let sender = AgentId::local("s", PLATFORM);
        let sender_inbox = main.register(sender.clone());
        svc.register_agent(sender.clone(), ContainerId::new("main"))
            .await;

        Self {
            svc,
            platform,
            directory,
            main,
            c2,
            sender,
            sender_inbox,
        }
    }

    /// Host `name` on `container` and record it in the directory.
    async fn agent_on(&self, name: &str, container: &InProcessContainer) -> (AgentId, Mailbox) {
        let id = AgentId::local(name, PLATFORM);
        let inbox = container.register(id.clone());
        self.svc
            .register_agent(id.clone(), container.id().clone())
            .await;
        (id, inbox)
    }

    fn message_to(&self, receiver: &AgentId, content: &str) -> SingleMessage {
        SingleMessage::new(
            AclMessage::new(Performative::Inform, self.sender.clone())
                .with_receiver(receiver.clone())
                .with_content(content),
        )
    }

    /// Next FAILURE notification received by the sender.
    async fn next_failure(&mut self) -> AclMessage {
        let msg = recv(&mut self.sender_inbox).await;
        assert_eq!(msg.acl().performative, Performative::Failure);
        assert_eq!(msg.sender(), &AgentId::system(PLATFORM));
        msg.acl().clone()
    }

    /// Wait until `count` messages have terminally failed.
    async fn wait_failed(&self, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.svc.stats().failed < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("failures expected");
    }

    /// Drain the queue and assert the sender got nothing.
    async fn assert_no_failure(&mut self) {
        self.svc.shutdown().await;
        assert!(
            self.sender_inbox.try_recv().is_err(),
            "no failure notification expected"
        );
    }
}

async fn recv(inbox: &mut Mailbox) -> SingleMessage {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("message expected")
        .expect("mailbox open")
}

fn fast_retries() -> DeliveryConfig {
    DeliveryConfig::default()
        .pool_size(2)
        .max_resolution_attempts(3)
        .resolution_retry_delay(Duration::from_millis(10))
}

// ── Local and intra-platform ───────────────────────────────────────────

#[tokio::test]
async fn local_delivery_caches_location() {
    let mut fx = Fixture::new(fast_retries()).await;
    let (a, mut a_inbox) = fx.agent_on("a", &fx.main.clone()).await;
    fx.svc.start();

    fx.svc.send(fx.message_to(&a, "hello")).await.unwrap();
    assert_eq!(recv(&mut a_inbox).await.acl().content, "hello");
    assert_eq!(fx.svc.cache().get(&a), Some(ContainerId::new("main")));

    // Second delivery goes through the cache.
    let (hits_before, _) = fx.svc.cache().hit_stats();
    fx.svc.send(fx.message_to(&a, "again")).await.unwrap();
    assert_eq!(recv(&mut a_inbox).await.acl().content, "again");
    assert!(fx.svc.cache().hit_stats().0 > hits_before);

    fx.assert_no_failure().await;
    let stats = serde_json::to_value(fx.svc.stats()).unwrap();
    assert_eq!(stats["delivered_local"], 2);
    assert_eq!(stats["outbox"]["queued_bytes"], 0);
    assert_eq!(stats["pool"]["delivered"], 2);
}

#[tokio::test]
async fn remote_delivery_is_forwarded_encoded() {
    let fx = Fixture::new(fast_retries()).await;
    let (b, mut b_inbox) = fx.agent_on("b", &fx.c2.clone()).await;

    let outcome = fx.svc.deliver(&fx.message_to(&b, "hi"), &b).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Forwarded(ContainerId::new("c2")));

    let received = recv(&mut b_inbox).await;
    assert!(received.encoded().is_some());
    assert_eq!(received.encoding(), Some("msgpack"));
    let decoded: AclMessage = rmp_serde::from_slice(received.encoded().unwrap()).unwrap();
    assert_eq!(decoded.content, "hi");
}

/// Node slice standing for a node the receiver just left: every dispatch
/// reports `NotFound` and completes the migration in the directory.
struct MigratedAway {
    node: ContainerId,
    directory: Arc<LocationDirectory<ContainerId>>,
    moved_to: ContainerId,
    dispatches: AtomicUsize,
}

#[async_trait::async_trait]
impl NodeSlice for MigratedAway {
    fn node(&self) -> &ContainerId {
        &self.node
    }

    async fn dispatch_locally(
        &self,
        _sender: &AgentId,
        _message: &SingleMessage,
        receiver: &AgentId,
    ) -> Result<(), DeliveryError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        self.directory
            .put(receiver.clone(), self.moved_to.clone())
            .await;
        Err(DeliveryError::not_found(receiver))
    }

    async fn route_out(
        &self,
        _message: &SingleMessage,
        _receiver: &AgentId,
        address: &str,
    ) -> Result<(), DeliveryError> {
        Err(DeliveryError::unreachable(address, "not a gateway"))
    }
}

#[tokio::test(start_paused = true)]
async fn migration_is_retried_until_resolved() {
    let fx = Fixture::new(fast_retries()).await;
    let n1 = Arc::new(MigratedAway {
        node: ContainerId::new("n1"),
        directory: fx.directory.clone(),
        moved_to: ContainerId::new("c2"),
        dispatches: AtomicUsize::new(0),
    });
    fx.platform.add_node(n1.clone());

    // Registered at n1, actually living on c2 by the time we dispatch.
    let b = AgentId::local("b", PLATFORM);
    let mut b_inbox = fx.c2.register(b.clone());
    fx.svc.register_agent(b.clone(), ContainerId::new("n1")).await;

    let outcome = fx.svc.deliver(&fx.message_to(&b, "moved"), &b).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Forwarded(ContainerId::new("c2")));
    assert_eq!(recv(&mut b_inbox).await.acl().content, "moved");

    assert_eq!(n1.dispatches.load(Ordering::SeqCst), 1);
    assert_eq!(fx.svc.stats().retries, 1);
    assert_eq!(fx.svc.cache().get(&b), Some(ContainerId::new("c2")));
}

#[tokio::test(start_paused = true)]
async fn unresolved_receiver_fails_after_max_attempts() {
    let mut fx = Fixture::new(fast_retries()).await;
    fx.svc.start();
    let ghost = AgentId::local("ghost", PLATFORM);

    fx.svc.send(fx.message_to(&ghost, "anyone?")).await.unwrap();
    let failure = fx.next_failure().await;
    assert!(failure.content.contains("MTS-error ghost@home"));
    assert!(failure.content.contains("agent not found"));
    assert_eq!(failure.receivers, vec![fx.sender.clone()]);

    // Three attempts: two retries.
    assert_eq!(fx.svc.stats().retries, 2);
    fx.assert_no_failure().await;
}

#[tokio::test(start_paused = true)]
async fn receiver_reregistered_within_bound_is_delivered() {
    let fx = Fixture::new(
        DeliveryConfig::default()
            .max_resolution_attempts(5)
            .resolution_retry_delay(Duration::from_millis(100)),
    )
    .await;
    let late = AgentId::local("late", PLATFORM);
    let mut inbox = fx.c2.register(late.clone());

    let register = {
        let svc = fx.svc.clone();
        let late = late.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            svc.register_agent(late, ContainerId::new("c2")).await;
        })
    };

    let outcome = fx
        .svc
        .deliver(&fx.message_to(&late, "finally"), &late)
        .await
        .unwrap();
    register.await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Forwarded(ContainerId::new("c2")));
    assert_eq!(recv(&mut inbox).await.acl().content, "finally");
    assert_eq!(fx.svc.stats().retries, 3);
}

#[tokio::test]
async fn stale_cache_entry_is_evicted_and_resolution_falls_through() {
    let fx = Fixture::new(fast_retries()).await;
    let (a, mut a_inbox) = fx.agent_on("a", &fx.main.clone()).await;
    fx.svc.cache().put(a.clone(), ContainerId::new("c2"));

    let outcome = fx.svc.deliver(&fx.message_to(&a, "x"), &a).await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Local);
    assert_eq!(recv(&mut a_inbox).await.acl().content, "x");

    let stats = fx.svc.stats();
    assert_eq!(stats.cache_evictions, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(fx.svc.cache().get(&a), Some(ContainerId::new("main")));
}

#[tokio::test]
async fn unreachable_node_is_not_retried() {
    let mut fx = Fixture::new(fast_retries()).await;
    let (b, _b_inbox) = fx.agent_on("b", &fx.c2.clone()).await;
    fx.c2.set_reachable(false);
    fx.svc.start();

    fx.svc.send(fx.message_to(&b, "x")).await.unwrap();
    let failure = fx.next_failure().await;
    assert!(failure.content.contains("unreachable: c2"));
    assert_eq!(fx.svc.stats().retries, 0);
    fx.assert_no_failure().await;
}

// ── Foreign platforms ──────────────────────────────────────────────────

/// Transport speaking one scheme; fails every send when `broken`.
struct StubMtp {
    protocol: &'static str,
    broken: bool,
    sent: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait::async_trait]
impl Mtp for StubMtp {
    fn name(&self) -> &str {
        self.protocol
    }

    fn protocols(&self) -> Vec<String> {
        vec![self.protocol.to_string()]
    }

    async fn deliver(&self, address: &str, message: &SingleMessage) -> Result<(), MtpError> {
        if self.broken {
            return Err(MtpError::Send {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let _ = self
            .sent
            .send((address.to_string(), message.acl().content.clone()));
        Ok(())
    }
}

fn install_stub_transports(fx: &Fixture) -> mpsc::UnboundedReceiver<(String, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for (class, protocol, broken) in [("stub.fail", "fail", true), ("stub.http", "http", false)] {
        let sent = tx.clone();
        fx.svc.register_transport_class(class, move |_address| {
            Ok(Arc::new(StubMtp {
                protocol,
                broken,
                sent: sent.clone(),
            }) as Arc<dyn Mtp>)
        });
    }
    fx.svc
        .install_transport("fail://main:1/acc", "stub.fail")
        .unwrap();
    fx.svc
        .install_transport("http://main:7778/acc", "stub.http")
        .unwrap();
    rx
}

#[tokio::test]
async fn foreign_delivery_falls_back_to_second_address() {
    let mut fx = Fixture::new(fast_retries()).await;
    let mut sent = install_stub_transports(&fx);
    fx.svc.start();

    let far = AgentId::new("f@far")
        .with_address("fail://far:1/acc")
        .with_address("http://far:7778/acc");
    fx.svc.send(fx.message_to(&far, "bonjour")).await.unwrap();

    let (address, content) = tokio::time::timeout(Duration::from_secs(5), sent.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(address, "http://far:7778/acc");
    assert_eq!(content, "bonjour");

    fx.assert_no_failure().await;
    assert_eq!(fx.svc.stats().foreign, 1);
}

#[tokio::test]
async fn foreign_receiver_without_addresses_fails_immediately() {
    let mut fx = Fixture::new(fast_retries()).await;
    let _sent = install_stub_transports(&fx);
    fx.svc.start();

    let far = AgentId::new("f@far");
    fx.svc.send(fx.message_to(&far, "lost")).await.unwrap();

    let failure = fx.next_failure().await;
    assert!(failure
        .content
        .contains("no valid address contained within the identifier of f@far"));
    assert_eq!(fx.svc.stats().retries, 0);
    fx.assert_no_failure().await;
}

#[tokio::test]
async fn foreign_receiver_with_only_failing_addresses() {
    let fx = Fixture::new(fast_retries()).await;
    let _sent = install_stub_transports(&fx);

    let far = AgentId::new("f@far").with_address("fail://far:1/acc");
    let mut msg = fx.message_to(&far, "x");
    msg.set_foreign_receiver(true);
    let err = fx.svc.deliver(&msg, &far).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Unreachable { .. }));

    let nowhere = AgentId::new("f@far").with_address("smtp://far/acc");
    let err = fx.svc.deliver(&msg, &nowhere).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NoRoute { .. }));
}

#[tokio::test]
async fn foreign_route_through_another_node() {
    let fx = Fixture::new(fast_retries()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    fx.c2.attach_transport(
        "http://c2:7778/acc",
        Arc::new(StubMtp {
            protocol: "http",
            broken: false,
            sent: tx,
        }),
    );
    let descriptor = mts_protocol::MtpDescriptor {
        name: "http".into(),
        class_name: "stub.http".into(),
        addresses: vec!["http://c2:7778/acc".into()],
        protocols: vec!["http".into()],
    };
    assert!(fx
        .svc
        .announce_route(&descriptor, &ContainerId::new("c2"))
        .unwrap());

    let far = AgentId::new("f@far").with_address("http://far:7778/acc");
    let mut msg = fx.message_to(&far, "via c2");
    msg.set_foreign_receiver(true);
    let outcome = fx.svc.deliver(&msg, &far).await.unwrap();
    assert_eq!(
        outcome,
        DeliveryOutcome::Foreign {
            address: "http://far:7778/acc".into()
        }
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        ("http://far:7778/acc".to_string(), "via c2".to_string())
    );
}

// ── Queue, suppression, batches ────────────────────────────────────────

#[tokio::test]
async fn queue_full_is_signalled_to_the_caller() {
    let mut fx = Fixture::new(
        DeliveryConfig::default()
            .warning_queue_bytes(8)
            .max_queue_bytes(10),
    )
    .await;
    let (a, _a_inbox) = fx.agent_on("a", &fx.main.clone()).await;

    fx.svc.send(fx.message_to(&a, "12345678")).await.unwrap();
    let err = fx.svc.send(fx.message_to(&a, "12345678")).await.unwrap_err();
    assert_eq!(err, DeliveryError::QueueFull { size: 8, max: 10 });
    assert_eq!(fx.svc.outbox().len(), 1);

    // The rejection itself is not reported back.
    assert!(fx.sender_inbox.try_recv().is_err());
    assert_eq!(fx.svc.stats().outbox.rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn system_agent_and_opted_out_failures_are_not_reported() {
    let mut fx = Fixture::new(fast_retries()).await;
    let ams = AgentId::system(PLATFORM);
    let mut ams_inbox = fx.main.register(ams.clone());
    fx.svc.register_agent(ams.clone(), ContainerId::new("main")).await;
    fx.svc.start();

    let ghost = AgentId::local("ghost", PLATFORM);
    let from_ams = SingleMessage::new(
        AclMessage::new(Performative::Inform, ams).with_receiver(ghost.clone()),
    );
    fx.svc.send(from_ams).await.unwrap();

    let mut acl = fx.message_to(&ghost, "quiet").acl().clone();
    acl.set_ignore_failure(true);
    fx.svc.send(SingleMessage::new(acl)).await.unwrap();

    // Both must have run out of retries before the queue is drained.
    fx.wait_failed(2).await;
    fx.assert_no_failure().await;
    assert!(ams_inbox.try_recv().is_err());
    let stats = fx.svc.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.notifications_sent, 0);
    assert_eq!(stats.notifications_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn failure_during_shutdown_drain_is_still_reported() {
    let mut fx = Fixture::new(fast_retries()).await;
    fx.svc.start();

    let ghost = AgentId::local("ghost", PLATFORM);
    fx.svc.send(fx.message_to(&ghost, "late")).await.unwrap();
    fx.svc.shutdown().await;

    let failure = fx
        .sender_inbox
        .try_recv()
        .expect("failure delivered before the workers stopped");
    assert_eq!(failure.acl().performative, Performative::Failure);
    assert!(failure.acl().content.contains("agent not found"));

    let stats = fx.svc.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.notifications_sent, 1);
    assert_eq!(stats.notifications_dropped, 0);
    assert_eq!(stats.outbox.queued_messages, 0);
    // New sends are still refused.
    assert_eq!(
        fx.svc.send(fx.message_to(&ghost, "after")).await.unwrap_err(),
        DeliveryError::ShutDown
    );
}

#[tokio::test(start_paused = true)]
async fn each_message_of_a_batch_gets_its_own_notification() {
    let mut fx = Fixture::new(fast_retries().pool_size(1).max_resolution_attempts(1)).await;
    let ghost = AgentId::local("ghost", PLATFORM);
    for i in 0..3 {
        fx.svc
            .send(fx.message_to(&ghost, &format!("m{i}")))
            .await
            .unwrap();
    }
    fx.svc.start();

    for _ in 0..3 {
        let failure = fx.next_failure().await;
        assert!(failure.content.contains("ghost@home"));
    }
    fx.assert_no_failure().await;
    assert_eq!(fx.svc.stats().notifications_sent, 3);
}

struct DenyNamed(&'static str);

impl Authority for DenyNamed {
    fn authorize(&self, _sender: &AgentId, receiver: &AgentId) -> Result<(), DeliveryError> {
        if receiver.local_name() == self.0 {
            Err(DeliveryError::Unauthorized {
                reason: format!("{receiver} is off limits"),
            })
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn authority_veto_is_reported() {
    let mut fx = Fixture::build(fast_retries(), Some(Arc::new(DenyNamed("vault")))).await;
    let (vault, mut vault_inbox) = fx.agent_on("vault", &fx.main.clone()).await;
    fx.svc.start();

    fx.svc.send(fx.message_to(&vault, "open")).await.unwrap();
    let failure = fx.next_failure().await;
    assert!(failure.content.contains("unauthorized: vault@home is off limits"));
    assert!(vault_inbox.try_recv().is_err());
    fx.assert_no_failure().await;
}

#[tokio::test]
async fn expired_message_is_reported_not_delivered() {
    let mut fx = Fixture::new(fast_retries()).await;
    let (a, mut a_inbox) = fx.agent_on("a", &fx.main.clone()).await;

    fx.svc
        .send_with_deadline(fx.message_to(&a, "stale"), a.clone(), tokio::time::Instant::now())
        .await
        .unwrap();
    fx.svc.start();

    let failure = fx.next_failure().await;
    assert!(failure.content.contains("delivery deadline expired"));
    fx.assert_no_failure().await;
    assert!(a_inbox.try_recv().is_err());
}
