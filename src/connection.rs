//! The connection: engine task, handshake, and request/response exchange.
//!
//! A connection owns three long-lived pieces:
//!
//! - the **engine task**, a `tokio::select!` loop that owns the codec,
//!   serializes outbound messages, polls for inbound frames, completes
//!   pending reply expectations, and routes monitored traffic into queues;
//! - the **dispatch task** (see [`crate::subscriber`]) draining those
//!   queues to registered consumers;
//! - the **handshake**, a fixed sequence of configuration commands run at
//!   connect time, each gated on its confirming reply.
//!
//! Correlated exchanges suspend the calling task until a matching reply
//! arrives, the TTL elapses, or the caller's cancellation token fires. The
//! expectation registry never outlives its deadline, so cancelled waits do
//! not leak correlation entries.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    alpha::AlphaGenerator,
    channel::ByteChannel,
    codec::MessageCodec,
    config::Config,
    error::{CBusError, SetupStep},
    exchange::TransactionGate,
    options::CBusOptions,
    reader::Reader,
    subscriber::{
        EventConsumer,
        MonitorFilter,
        SubscriberRegistry,
        SubscriptionHandle,
        run_dispatcher,
    },
    wire::{
        CBusMessage,
        CalData,
        CalReply,
        EncodedReply,
        MonitoredSal,
        Parameter,
        Reply,
        Request,
        request::parameter_write,
    },
    writer::Writer,
};

/// Predicate deciding whether a received message answers a pending request.
pub type ReplyMatcher = Box<dyn Fn(&CBusMessage) -> bool + Send>;

/// A registered wait for a correlated reply.
struct Expectation {
    matcher: ReplyMatcher,
    reply_tx: oneshot::Sender<CBusMessage>,
    deadline: Instant,
}

enum EngineCommand {
    Send {
        message: CBusMessage,
        expectation: Option<Expectation>,
        done: oneshot::Sender<Result<(), CBusError>>,
    },
    SetOptions(CBusOptions),
}

/// A C-Bus PCI connection.
pub struct Connection {
    config: Config,
    alpha: Arc<AlphaGenerator>,
    gate: TransactionGate,
    subscribers: Arc<SubscriberRegistry>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    command_tx: mpsc::Sender<EngineCommand>,
    // Consumed when the engine task starts.
    pending_channel: std::sync::Mutex<Option<(Box<dyn ByteChannel>, mpsc::Receiver<EngineCommand>)>>,
}

impl Connection {
    /// Create a connection over `channel`. Nothing runs until
    /// [`Connection::connect`] is called.
    #[must_use]
    pub fn new(channel: impl ByteChannel + 'static, config: Config) -> Connection {
        let (command_tx, command_rx) = mpsc::channel(16);
        Connection {
            gate: TransactionGate::new(config.max_concurrent_exchanges),
            config,
            alpha: Arc::new(AlphaGenerator::new()),
            subscribers: Arc::new(SubscriberRegistry::default()),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            command_tx,
            pending_channel: std::sync::Mutex::new(Some((Box::new(channel), command_rx))),
        }
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.connected.load(Ordering::Acquire) }

    /// The configuration this connection was built with.
    #[must_use]
    pub fn config(&self) -> &Config { &self.config }

    /// Start the engine and dispatch tasks and run the connection handshake.
    ///
    /// With `await_setup_complete` unset the call reports success as soon as
    /// the tasks are running and lets the handshake finish in the
    /// background. That mode exists for tests only.
    ///
    /// # Errors
    ///
    /// [`CBusError::AlreadyRunning`] on a second call, or the failure of the
    /// first handshake step that did not complete. A failed handshake leaves
    /// the connection object intact for inspection; the engine keeps
    /// running until [`Connection::close`].
    pub async fn connect(&self) -> Result<(), CBusError> {
        let (channel, command_rx) = self
            .pending_channel
            .lock()
            .expect("connection state lock poisoned")
            .take()
            .ok_or(CBusError::AlreadyRunning)?;

        let codec = MessageCodec::with_give_up_threshold(
            channel,
            CBusOptions::NEUTRAL,
            self.config.give_up_threshold,
        );
        let (sal_tx, sal_rx) = mpsc::channel(64);
        let (mmi_tx, mmi_rx) = mpsc::channel(64);

        self.tasks.spawn(run_engine(
            codec,
            command_rx,
            self.shutdown.clone(),
            sal_tx,
            mmi_tx,
            self.config.poll_interval,
        ));
        self.tasks.spawn(run_dispatcher(
            Arc::clone(&self.subscribers),
            sal_rx,
            mmi_rx,
            self.shutdown.clone(),
        ));

        if !self.config.await_setup_complete {
            warn!(
                "connection used in an unsafe way: reporting connected before \
                 setup completes. DO NOT use this mode in production"
            );
            let setup = SetupDriver {
                config: self.config.clone(),
                command_tx: self.command_tx.clone(),
                shutdown: self.shutdown.clone(),
                connected: Arc::clone(&self.connected),
            };
            self.connected.store(true, Ordering::Release);
            self.tasks.spawn(async move {
                if let Err(err) = setup.run().await {
                    warn!(%err, "background connection setup failed");
                }
            });
            return Ok(());
        }

        let setup = SetupDriver {
            config: self.config.clone(),
            command_tx: self.command_tx.clone(),
            shutdown: self.shutdown.clone(),
            connected: Arc::clone(&self.connected),
        };
        setup.run().await
    }

    /// Stop the engine and dispatch tasks and wait for them to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.connected.store(false, Ordering::Release);
    }

    /// Send `message` and suspend until a reply matching `matcher` arrives.
    ///
    /// # Errors
    ///
    /// [`CBusError::RequestTimeout`] when `ttl` elapses first,
    /// [`CBusError::Cancelled`] when `cancel` fires first, and
    /// [`CBusError::NotRunning`] when the engine is gone.
    pub async fn send_request(
        &self,
        message: CBusMessage,
        matcher: ReplyMatcher,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<CBusMessage, CBusError> {
        engine_exchange(
            &self.command_tx,
            &self.shutdown,
            message,
            matcher,
            ttl,
            Some(cancel),
        )
        .await
    }

    /// Send `message` without expecting any reply.
    ///
    /// # Errors
    ///
    /// Propagates send failures from the engine.
    pub async fn send_message(&self, message: CBusMessage) -> Result<(), CBusError> {
        self.submit(message, None).await
    }

    async fn submit(
        &self,
        message: CBusMessage,
        expectation: Option<Expectation>,
    ) -> Result<(), CBusError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Send {
                message,
                expectation,
                done: done_tx,
            })
            .await
            .map_err(|_| CBusError::NotRunning)?;
        done_rx.await.map_err(|_| CBusError::NotRunning)?
    }

    /// Register a consumer for monitored traffic.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: MonitorFilter,
        consumer: EventConsumer,
    ) -> SubscriptionHandle {
        self.subscribers.subscribe(name, filter, consumer)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.unsubscribe(handle);
    }

    /// Typed read operations over this connection.
    #[must_use]
    pub fn reader(&self) -> Reader<'_> { Reader::new(self) }

    /// Typed write operations over this connection.
    #[must_use]
    pub fn writer(&self) -> Writer<'_> { Writer::new(self) }

    pub(crate) fn alpha(&self) -> &AlphaGenerator { &self.alpha }

    pub(crate) fn gate(&self) -> &TransactionGate { &self.gate }

    pub(crate) fn request_ttl(&self) -> Duration { self.config.request_ttl }
}

/// Runs the handshake against the engine. Shared by the awaited and the
/// background (unsafe) connect paths.
struct SetupDriver {
    config: Config,
    command_tx: mpsc::Sender<EngineCommand>,
    shutdown: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl SetupDriver {
    async fn run(&self) -> Result<(), CBusError> {
        // The PCI may be mid-frame from a previous session; reset twice
        // before giving up.
        if let Err(first) = self.send_reset().await {
            debug!(%first, "first reset attempt failed, retrying once");
            self.send_reset()
                .await
                .map_err(|err| err.at_setup_step(SetupStep::Reset))?;
        }
        tokio::time::sleep(self.config.settle_delay).await;
        debug!("reset done");

        self.write_parameter(
            SetupStep::ApplicationFilter1,
            Parameter::ApplicationAddress1,
            self.config.monitored_application_1,
        )
        .await?;
        self.write_parameter(
            SetupStep::ApplicationFilter2,
            Parameter::ApplicationAddress2,
            self.config.monitored_application_2,
        )
        .await?;
        debug!("application filters set");

        self.write_parameter(
            SetupStep::InterfaceOptions3,
            Parameter::InterfaceOptions3,
            self.config.interface_options_3(),
        )
        .await?;
        self.set_options(self.config.options_after_interface_options_3())
            .await?;

        self.write_parameter(
            SetupStep::InterfaceOptions1PowerUp,
            Parameter::InterfaceOptions1PowerUpSettings,
            self.config.interface_options_1(),
        )
        .await?;
        self.write_parameter(
            SetupStep::InterfaceOptions1,
            Parameter::InterfaceOptions1,
            self.config.interface_options_1(),
        )
        .await?;
        self.set_options(self.config.negotiated_options()).await?;

        self.connected.store(true, Ordering::Release);
        info!("connection setup complete");
        Ok(())
    }

    /// Send the unconditional reset and wait for its echo (or a power-up
    /// notification from a PCI that just rebooted).
    async fn send_reset(&self) -> Result<(), CBusError> {
        let matcher: ReplyMatcher = Box::new(|message| {
            matches!(
                message,
                CBusMessage::ToServer(Request::Reset) | CBusMessage::ToClient(Reply::PowerUp)
            )
        });
        self.exchange(
            CBusMessage::ToServer(Request::Reset),
            matcher,
            self.config.reset_timeout,
        )
        .await
        .map(|_| ())
    }

    /// One handshake step: write a parameter, wait for its acknowledge, then
    /// give the PCI time to apply the setting and flush its own echo.
    async fn write_parameter(
        &self,
        step: SetupStep,
        parameter: Parameter,
        value: u8,
    ) -> Result<(), CBusError> {
        debug!(%parameter, value, "writing setup parameter");
        let matcher: ReplyMatcher = Box::new(move |message| {
            message_acknowledges(message, parameter) || is_server_error(message)
        });
        let reply = self
            .exchange(
                CBusMessage::ToServer(parameter_write(parameter, value)),
                matcher,
                self.config.acknowledge_timeout,
            )
            .await
            .map_err(|err| err.at_setup_step(step))?;
        if is_server_error(&reply) {
            return Err(CBusError::UnsupportedMessage.at_setup_step(step));
        }
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn exchange(
        &self,
        message: CBusMessage,
        matcher: ReplyMatcher,
        ttl: Duration,
    ) -> Result<CBusMessage, CBusError> {
        engine_exchange(&self.command_tx, &self.shutdown, message, matcher, ttl, None).await
    }

    async fn set_options(&self, options: CBusOptions) -> Result<(), CBusError> {
        self.command_tx
            .send(EngineCommand::SetOptions(options))
            .await
            .map_err(|_| CBusError::NotRunning)
    }
}

/// Register a reply expectation with the engine, send the message, and wait
/// for the correlated reply under `ttl`, the engine's shutdown token, and an
/// optional caller cancellation token.
async fn engine_exchange(
    command_tx: &mpsc::Sender<EngineCommand>,
    shutdown: &CancellationToken,
    message: CBusMessage,
    matcher: ReplyMatcher,
    ttl: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<CBusMessage, CBusError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    command_tx
        .send(EngineCommand::Send {
            message,
            expectation: Some(Expectation {
                matcher,
                reply_tx,
                deadline: Instant::now() + ttl,
            }),
            done: done_tx,
        })
        .await
        .map_err(|_| CBusError::NotRunning)?;
    done_rx.await.map_err(|_| CBusError::NotRunning)??;

    // A default token never fires; the timeout arm bounds the wait.
    let cancel = cancel.cloned().unwrap_or_default();
    tokio::select! {
        () = cancel.cancelled() => Err(CBusError::Cancelled),
        () = shutdown.cancelled() => Err(CBusError::NotRunning),
        reply = tokio::time::timeout(ttl, reply_rx) => match reply {
            Ok(Ok(message)) => Ok(message),
            // Sender dropped: the engine purged the expectation.
            Ok(Err(_)) | Err(_) => Err(CBusError::RequestTimeout),
        },
    }
}

fn is_server_error(message: &CBusMessage) -> bool {
    matches!(message, CBusMessage::ToClient(Reply::ServerError))
}

/// Whether `message` is the parameter acknowledge for `parameter`, directly
/// or embedded in a confirmation.
fn message_acknowledges(message: &CBusMessage, parameter: Parameter) -> bool {
    fn reply_acknowledges(reply: &Reply, parameter: Parameter) -> bool {
        match reply {
            Reply::Encoded(EncodedReply::CalReply(cal_reply)) => matches!(
                cal_reply.cal(),
                CalData::Acknowledge { parameter: acknowledged, .. } if *acknowledged == parameter
            ),
            Reply::Confirmation {
                embedded: Some(embedded),
                ..
            } => reply_acknowledges(embedded, parameter),
            _ => false,
        }
    }
    match message {
        CBusMessage::ToClient(reply) => reply_acknowledges(reply, parameter),
        CBusMessage::ToServer(_) => false,
    }
}

/// The engine loop: owns the codec, serializes sends, polls for frames,
/// matches expectations, and routes monitored traffic.
async fn run_engine(
    mut codec: MessageCodec<Box<dyn ByteChannel>>,
    mut command_rx: mpsc::Receiver<EngineCommand>,
    shutdown: CancellationToken,
    sal_tx: mpsc::Sender<MonitoredSal>,
    mmi_tx: mpsc::Sender<CalReply>,
    poll_interval: Duration,
) {
    debug!("engine task started");
    let mut expectations: Vec<Expectation> = Vec::new();
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            command = command_rx.recv() => match command {
                Some(EngineCommand::Send { message, expectation, done }) => {
                    match codec.send(&message).await {
                        Ok(()) => {
                            if let Some(expectation) = expectation {
                                expectations.push(expectation);
                            }
                            let _ = done.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = done.send(Err(err));
                        }
                    }
                }
                Some(EngineCommand::SetOptions(options)) => {
                    debug!(?options, "session options updated");
                    codec.set_options(options);
                }
                None => break,
            },

            received = poll_once(&mut codec, poll_interval) => match received {
                Ok(Some(message)) => {
                    route_message(message, &mut expectations, &sal_tx, &mmi_tx);
                    purge_expired(&mut expectations);
                }
                Ok(None) => purge_expired(&mut expectations),
                Err(err) => {
                    warn!(%err, "receive failed, stopping engine");
                    break;
                }
            },
        }
    }
    info!("engine task ending");
}

/// Wait for terminator-shaped bytes (bounded by the poll interval), then
/// attempt one receive.
async fn poll_once(
    codec: &mut MessageCodec<Box<dyn ByteChannel>>,
    poll_interval: Duration,
) -> Result<Option<CBusMessage>, CBusError> {
    codec.wait_for_terminator(poll_interval).await?;
    codec.receive().await
}

fn route_message(
    message: CBusMessage,
    expectations: &mut Vec<Expectation>,
    sal_tx: &mpsc::Sender<MonitoredSal>,
    mmi_tx: &mpsc::Sender<CalReply>,
) {
    if let Some(index) = expectations
        .iter()
        .position(|expectation| (expectation.matcher)(&message))
    {
        let expectation = expectations.swap_remove(index);
        trace!("completing pending exchange");
        if expectation.reply_tx.send(message).is_err() {
            debug!("exchange abandoned before its reply arrived");
        }
        return;
    }

    // No pending exchange wants it: monitored traffic goes to the
    // dispatcher, everything else is logged and dropped.
    match message {
        CBusMessage::ToClient(Reply::Encoded(EncodedReply::MonitoredSal(sal))) => {
            if let Err(err) = sal_tx.try_send(sal) {
                warn!(%err, "monitored sal queue full, dropping event");
            }
        }
        CBusMessage::ToClient(Reply::Encoded(EncodedReply::CalReply(reply))) => {
            if let Err(err) = mmi_tx.try_send(reply) {
                warn!(%err, "monitored mmi queue full, dropping event");
            }
        }
        other => debug!(?other, "received unhandled message"),
    }
}

fn purge_expired(expectations: &mut Vec<Expectation>) {
    let now = Instant::now();
    expectations.retain(|expectation| {
        let keep = expectation.deadline > now;
        if !keep {
            debug!("purging expired reply expectation");
        }
        keep
    });
}
