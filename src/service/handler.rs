//! Packet service lifecycle of one radio
//!
//! ```text
//! IDLE -create-> READY -open-> OPEN -enable-> PAUSE -start-> DECODE
//!                  ^                            ^  <-stop-     |
//!                  |                          disable       disable
//!                  |                            v              v
//!                  +----------close---------- CLOSE <-close-- STOP
//! ```
//!
//! Operations are serialized per radio by the session lock, so radio
//! commands never overlap. A request in the wrong state is rejected
//! before anything changes.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::callback::{Reclaimer, WorkerSpawner};
use super::state::{ReceiveStats, ServiceShared, ServiceState, ServiceStatus};
use crate::buffer::{rx_pool_name, FrameBuffer, FrameCallback, PoolRegistry};
use crate::capture::{CaptureChannel, StreamPool, TimerDriver};
use crate::config::Config;
use crate::decoder::{DecoderAck, DecoderCommand, DecoderLauncher, DecoderLink};
use crate::diag::{EventFlags, EventSource};
use crate::error::{PoolError, ServiceError};
use crate::hal::{CaptureHal, CommandOutcome, Encoding, RadioCommand, RadioCommander, RadioId, RxConfig};

/// External collaborators of a packet service
#[derive(Clone)]
pub struct ServicePorts {
    pub hal: Arc<dyn CaptureHal>,
    pub commander: RadioCommander,
    pub decoder: Arc<dyn DecoderLauncher>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

struct DecoderPort {
    commands: crossbeam_channel::Sender<DecoderCommand>,
    /// Never read; source of fresh ack receivers. The decoder link owns
    /// the only sender.
    acks: broadcast::Receiver<DecoderAck>,
}

/// Resources held between create/release and open/close
#[derive(Default)]
struct Session {
    reclaimer: Option<Reclaimer>,
    capture: Option<Arc<CaptureChannel>>,
    timers: Option<TimerDriver>,
    decoder: Option<DecoderPort>,
}

pub struct PacketService {
    shared: Arc<ServiceShared>,
    ports: ServicePorts,
    config: Config,
    pools: Arc<PoolRegistry>,
    close_token: Semaphore,
    session: Mutex<Session>,
}

async fn await_ack(acks: &mut broadcast::Receiver<DecoderAck>, want: DecoderAck) -> bool {
    loop {
        match acks.recv().await {
            Ok(ack) if ack == want => return true,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

impl PacketService {
    pub fn new(radio: RadioId, config: Config, pools: Arc<PoolRegistry>, ports: ServicePorts) -> Self {
        Self {
            shared: ServiceShared::new(radio, ports.spawner.clone()),
            ports,
            config,
            pools,
            close_token: Semaphore::new(1),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn radio(&self) -> RadioId {
        self.shared.radio
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    pub fn stats(&self) -> ReceiveStats {
        self.shared.lock().stats
    }

    pub fn callbacks_outstanding(&self) -> usize {
        self.shared.callbacks_outstanding()
    }

    pub fn events(&self) -> &Arc<EventSource> {
        &self.shared.events
    }

    pub fn status(&self) -> ServiceStatus {
        let core = self.shared.lock();
        ServiceStatus {
            radio: self.shared.radio,
            state: core.state,
            rx: core.rx,
            stats: core.stats,
            callbacks_outstanding: core.callbacks_outstanding,
        }
    }

    /// Capture channel of the open session
    pub async fn capture(&self) -> Option<Arc<CaptureChannel>> {
        self.session.lock().await.capture.clone()
    }

    fn expect_state(&self, op: &'static str, allowed: &[ServiceState]) -> Result<ServiceState, ServiceError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            debug!("Radio {} {} rejected in {}", self.radio(), op, state);
            Err(ServiceError::Rejected {
                radio: self.radio(),
                op,
                state,
            })
        }
    }

    async fn command(&self, command: RadioCommand, config: RxConfig) -> Result<(), ServiceError> {
        let radio = self.radio();
        match self.ports.commander.submit(radio, command, config).await {
            CommandOutcome::Accepted => Ok(()),
            CommandOutcome::TimedOut => Err(ServiceError::TimedOut {
                radio,
                waiting_for: "radio command",
            }),
            CommandOutcome::Rejected => Err(ServiceError::CommandRejected { radio, command }),
        }
    }

    /// Allocate per-radio resources. Valid in IDLE only.
    pub async fn create(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        self.expect_state("create", &[ServiceState::Idle])?;
        let radio = self.radio();

        let frames = self.pools.find_or_create(
            &rx_pool_name(radio),
            self.config.rx_buffers,
            self.config.frame_len,
        );
        // On failure the pool reference is dropped with this scope
        let reclaimer = Reclaimer::spawn(self.shared.clone()).map_err(|source| ServiceError::Resource {
            radio,
            what: "callback reclaimer",
            source,
        })?;

        if self.close_token.available_permits() == 0 {
            self.close_token.add_permits(1);
        }
        session.reclaimer = Some(reclaimer);
        {
            let mut core = self.shared.lock();
            core.stats = ReceiveStats::default();
            core.callback = None;
            core.callbacks_outstanding = 0;
            core.frames = Some(frames);
            core.state = ServiceState::Ready;
        }
        info!("Radio {} packet service created", radio);
        Ok(())
    }

    /// Open a receive session. Valid in READY only.
    pub async fn open(&self, rx: RxConfig) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        self.expect_state("open", &[ServiceState::Ready])?;
        let radio = self.radio();

        match tokio::time::timeout(self.config.close_wait(), self.close_token.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            _ => {
                return Err(ServiceError::TimedOut {
                    radio,
                    waiting_for: "previous close",
                })
            }
        }

        {
            let mut core = self.shared.lock();
            core.rx = rx;
            core.stats = ReceiveStats::default();
        }

        let opened = match self.start_session(&mut session) {
            Ok(()) => self.command(RadioCommand::RxOpen, rx).await,
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            self.end_session(&mut session).await;
            self.close_token.add_permits(1);
            warn!("Radio {} open failed: {}", radio, e);
            return Err(e);
        }

        self.shared.set_state(ServiceState::Open);
        self.shared.events.raise(EventFlags::CHANNEL_OPEN);
        info!("Radio {} receive opened on {} Hz", radio, rx.base_frequency);
        Ok(())
    }

    /// Attach capture, start its timers and launch the decoder
    fn start_session(&self, session: &mut Session) -> Result<(), ServiceError> {
        let radio = self.radio();
        let Some(frames) = self.shared.lock().frames.clone() else {
            unreachable!("radio {} has no frame pool outside IDLE", radio);
        };

        let (streams_tx, streams_rx) = bounded(self.config.pulse_streams.max(1));
        let capture = CaptureChannel::new(
            radio,
            self.ports.hal.clone(),
            StreamPool::new(
                radio,
                self.config.pulse_streams,
                self.config.pulse_segments,
                self.config.pulse_segment_len,
            ),
            streams_tx,
            self.shared.events.clone(),
            self.config.capture_timing(),
        );
        capture.attach()?;
        session.capture = Some(capture.clone());

        let timers = TimerDriver::spawn(capture).map_err(|source| ServiceError::Resource {
            radio,
            what: "capture timer driver",
            source,
        })?;
        session.timers = Some(timers);

        let (commands, commands_rx) = bounded(4);
        let (acks_tx, acks) = broadcast::channel(8);
        let link = DecoderLink {
            radio,
            commands: commands_rx,
            acks: acks_tx,
            streams: streams_rx,
            frames,
            sink: self.shared.clone(),
            events: self.shared.events.clone(),
        };
        if let Err(source) = self.ports.decoder.launch(link) {
            self.shared.events.raise(EventFlags::DECODER_START_FAIL);
            return Err(ServiceError::Resource {
                radio,
                what: "decoder thread",
                source,
            });
        }
        session.decoder = Some(DecoderPort { commands, acks });
        Ok(())
    }

    /// Release whatever `start_session` set up
    async fn end_session(&self, session: &mut Session) {
        // Detaching closes any open stream so the decoder sees its end
        if let Some(capture) = session.capture.take() {
            capture.detach();
        }
        if let Some(port) = session.decoder.take() {
            let mut acks = port.acks.resubscribe();
            if port.commands.send(DecoderCommand::Terminate).is_ok() {
                let wait = await_ack(&mut acks, DecoderAck::Terminated);
                if tokio::time::timeout(self.config.close_wait(), wait).await.is_err() {
                    warn!("Radio {} decoder did not acknowledge terminate", self.radio());
                }
            }
        }
        if let Some(timers) = session.timers.take() {
            self.join_blocking("capture timer driver", move || timers.stop()).await;
        }
    }

    /// Run a thread join on the blocking pool
    async fn join_blocking(&self, what: &str, join: impl FnOnce() + Send + 'static) {
        if let Err(e) = tokio::task::spawn_blocking(join).await {
            warn!("Radio {} failed to join {}: {}", self.radio(), what, e);
        }
    }

    /// Start reception on a channel. Valid in OPEN or STOP.
    pub async fn enable_reception(
        &self,
        channel: u8,
        squelch: u8,
        callback: Option<FrameCallback>,
    ) -> Result<(), ServiceError> {
        let session = self.session.lock().await;
        self.expect_state("enable reception", &[ServiceState::Open, ServiceState::Stop])?;

        let mut rx = self.shared.lock().rx;
        rx.channel = channel;
        rx.squelch = squelch;
        self.command(RadioCommand::RxStart, rx).await?;

        {
            let mut core = self.shared.lock();
            core.rx = rx;
            core.callback = callback;
            core.state = ServiceState::Pause;
        }
        if let Some(capture) = session.capture.as_ref() {
            capture.enable();
        }
        self.shared.events.raise(EventFlags::DECODER_START);
        debug!("Radio {} reception enabled on channel {}", self.radio(), channel);
        Ok(())
    }

    /// Start decoding and wait for the decoder's acknowledgement.
    ///
    /// # Panics
    /// If the service is not in PAUSE.
    pub async fn start_decoder(&self) -> Result<(), ServiceError> {
        let session = self.session.lock().await;
        let state = self.state();
        assert!(
            state == ServiceState::Pause,
            "start decoder for radio {} in state {}",
            self.radio(),
            state
        );

        let encoding = self.ports.hal.link_encoding(self.radio());
        if encoding != Encoding::Afsk {
            self.shared.events.raise(EventFlags::DECODER_START_FAIL);
            return Err(ServiceError::Unsupported("2FSK decoding"));
        }

        self.signal_decoder(&session, DecoderCommand::Start, DecoderAck::Started)
            .await?;
        self.shared.set_state(ServiceState::Decode);
        info!("Radio {} decoder started", self.radio());
        Ok(())
    }

    /// Stop decoding and wait for the decoder's acknowledgement.
    ///
    /// # Panics
    /// If the service is not in DECODE.
    pub async fn stop_decoder(&self) -> Result<(), ServiceError> {
        let session = self.session.lock().await;
        let state = self.state();
        assert!(
            state == ServiceState::Decode,
            "stop decoder for radio {} in state {}",
            self.radio(),
            state
        );

        self.signal_decoder(&session, DecoderCommand::Stop, DecoderAck::Stopped)
            .await?;
        self.shared.set_state(ServiceState::Pause);
        info!("Radio {} decoder stopped", self.radio());
        Ok(())
    }

    async fn signal_decoder(
        &self,
        session: &Session,
        command: DecoderCommand,
        ack: DecoderAck,
    ) -> Result<(), ServiceError> {
        let radio = self.radio();
        let Some(port) = session.decoder.as_ref() else {
            unreachable!("radio {} has no decoder while receiving", radio);
        };
        let lost = || ServiceError::Resource {
            radio,
            what: "decoder thread",
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "decoder exited"),
        };

        // Listen before signalling so the acknowledgement cannot be missed
        let mut acks = port.acks.resubscribe();
        port.commands.send(command).map_err(|_| lost())?;
        if await_ack(&mut acks, ack).await {
            Ok(())
        } else {
            Err(lost())
        }
    }

    /// Stop reception. Valid in DECODE or PAUSE.
    pub async fn disable_reception(&self) -> Result<(), ServiceError> {
        let session = self.session.lock().await;
        self.expect_state("disable reception", &[ServiceState::Decode, ServiceState::Pause])?;

        let rx = self.shared.lock().rx;
        self.command(RadioCommand::RxStop, rx).await?;

        if let Some(capture) = session.capture.as_ref() {
            capture.disable();
        }
        self.shared.set_state(ServiceState::Stop);
        self.shared.events.raise(EventFlags::CHANNEL_STOP);
        debug!("Radio {} reception disabled", self.radio());
        Ok(())
    }

    /// Close the receive session. Valid in STOP, repeatable from CLOSE.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        self.expect_state("close", &[ServiceState::Stop, ServiceState::Close])?;
        self.shared.set_state(ServiceState::Close);

        let rx = self.shared.lock().rx;
        self.command(RadioCommand::RxClose, rx).await?;

        self.end_session(&mut session).await;
        self.shared.events.raise(EventFlags::CHANNEL_CLOSE);
        self.shared.set_state(ServiceState::Ready);
        self.close_token.add_permits(1);
        info!("Radio {} receive closed", self.radio());
        Ok(())
    }

    /// Tear down per-radio resources. Valid in READY only.
    ///
    /// Waits for callbacks still running to be reclaimed.
    pub async fn release(&self) -> Result<(), ServiceError> {
        let mut session = self.session.lock().await;
        self.expect_state("release", &[ServiceState::Ready])?;

        {
            let mut core = self.shared.lock();
            core.frames = None;
            core.callback = None;
        }
        if let Some(reclaimer) = session.reclaimer.take() {
            self.join_blocking("callback reclaimer", move || reclaimer.stop()).await;
        }
        // Frames left on the pull queue go back to their pool
        while self.shared.deliveries().try_recv().is_ok() {}

        self.shared.set_state(ServiceState::Idle);
        info!("Radio {} packet service released", self.radio());
        Ok(())
    }

    pub async fn hibernate(&self) -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported("service hibernate"))
    }

    pub async fn wake(&self) -> Result<(), ServiceError> {
        Err(ServiceError::Unsupported("service wake"))
    }

    /// Next frame from the pull queue, waiting up to `timeout`
    pub fn receive_frame(&self, timeout: Duration) -> Option<FrameBuffer> {
        self.shared.deliveries().recv_timeout(timeout).ok()
    }

    pub fn try_receive_frame(&self) -> Option<FrameBuffer> {
        self.shared.deliveries().try_recv().ok()
    }

    /// Take an empty frame buffer from this radio's pool
    pub fn acquire_frame(&self, timeout: Duration) -> Result<FrameBuffer, PoolError> {
        let radio = self.radio();
        let pool = self.shared.lock().frames.clone();
        match pool {
            Some(pool) => pool.acquire_timeout(radio, timeout),
            None => Err(PoolError::Exhausted(rx_pool_name(radio))),
        }
    }

    /// Validate and deliver a completed frame
    pub fn dispatch_frame(&self, frame: FrameBuffer) -> crate::buffer::FrameStatus {
        self.shared.dispatch(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::buffer::FrameStatus;
    use crate::capture::ChannelState;
    use crate::decoder::ThreadedDecoder;
    use crate::diag::EventFlags;
    use crate::service::callback::ThreadSpawner;
    use crate::sim::{aprs_frame, frame_pulses, ByteDemod, SimManager, SimRadio, SimReply};

    const RADIO: RadioId = RadioId(1);

    fn test_config() -> Config {
        Config {
            command_timeout_ms: 100,
            close_wait_ms: 200,
            pulse_segment_len: 64,
            ..Config::default()
        }
    }

    fn rx_config() -> RxConfig {
        RxConfig {
            encoding: Encoding::Afsk,
            base_frequency: 144_900_000,
            step_hz: 0,
            channel: 0,
            squelch: 0,
        }
    }

    struct Rig {
        sim: Arc<SimRadio>,
        manager: SimManager,
        service: PacketService,
    }

    fn rig_with(decoder: Arc<dyn DecoderLauncher>) -> Rig {
        let config = test_config();
        let sim = SimRadio::new();
        let manager = SimManager::spawn(16);
        let ports = ServicePorts {
            hal: sim.clone(),
            commander: manager.commander(config.command_timeout()),
            decoder,
            spawner: Arc::new(ThreadSpawner),
        };
        let service = PacketService::new(RADIO, config, Arc::new(PoolRegistry::new()), ports);
        Rig {
            sim,
            manager,
            service,
        }
    }

    fn rig() -> Rig {
        rig_with(Arc::new(ThreadedDecoder::new(|| Box::new(ByteDemod::default()))))
    }

    /// Keeps the link so no decoder ever answers
    #[derive(Default)]
    struct SilentDecoder(StdMutex<Vec<DecoderLink>>);

    impl DecoderLauncher for SilentDecoder {
        fn launch(&self, link: DecoderLink) -> std::io::Result<()> {
            self.0.lock().unwrap().push(link);
            Ok(())
        }
    }

    /// Takes one command, then exits without acknowledging it
    struct DyingDecoder;

    impl DecoderLauncher for DyingDecoder {
        fn launch(&self, link: DecoderLink) -> std::io::Result<()> {
            std::thread::Builder::new()
                .name("pkt_dec_dying".into())
                .spawn(move || {
                    let _ = link.commands.recv();
                })
                .map(|_| ())
        }
    }

    async fn to_decode(service: &PacketService, callback: Option<FrameCallback>) {
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, callback).await.unwrap();
        service.start_decoder().await.unwrap();
        assert_eq!(service.state(), ServiceState::Decode);
    }

    async fn to_idle(service: &PacketService) {
        if service.state() == ServiceState::Decode {
            service.stop_decoder().await.unwrap();
        }
        service.disable_reception().await.unwrap();
        service.close().await.unwrap();
        service.release().await.unwrap();
        assert_eq!(service.state(), ServiceState::Idle);
    }

    /// Run one packet through the simulated radio and wait for its stream
    fn send_packet(sim: &SimRadio, service: &PacketService, capture: &CaptureChannel, frame: &[u8]) {
        sim.set_cca(RADIO, true);
        wait_until(|| capture.state() == ChannelState::Active);
        for (width, period) in frame_pulses(frame) {
            sim.pulse(RADIO, width, period);
        }
        wait_until(|| service.stats().frames > 0);
        sim.set_cca(RADIO, false);
        wait_until(|| capture.state() == ChannelState::Ready);
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let rig = rig();
        let service = &rig.service;
        assert_eq!(service.state(), ServiceState::Idle);

        to_decode(service, None).await;
        assert!(rig.sim.is_attached(RADIO));
        let flags = service.events().take();
        assert!(flags.contains(EventFlags::CHANNEL_OPEN | EventFlags::DECODER_START));

        to_idle(service).await;
        assert!(!rig.sim.is_attached(RADIO));
        assert_eq!(
            rig.manager.commands(),
            vec![
                RadioCommand::RxOpen,
                RadioCommand::RxStart,
                RadioCommand::RxStop,
                RadioCommand::RxClose
            ]
        );
    }

    #[tokio::test]
    async fn test_second_open_rejected() {
        let rig = rig();
        let service = &rig.service;
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        assert_eq!(service.state(), ServiceState::Open);

        let err = service.open(rx_config()).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(service.state(), ServiceState::Open);
        assert_eq!(rig.manager.commands(), vec![RadioCommand::RxOpen]);
    }

    #[tokio::test]
    async fn test_wrong_state_rejections() {
        let rig = rig();
        let service = &rig.service;

        assert!(service.release().await.unwrap_err().is_rejection());
        assert!(service.open(rx_config()).await.unwrap_err().is_rejection());
        service.create().await.unwrap();
        assert!(service.create().await.unwrap_err().is_rejection());
        assert!(service.close().await.unwrap_err().is_rejection());
        assert!(service.disable_reception().await.unwrap_err().is_rejection());
        assert!(service.enable_reception(0, 0, None).await.unwrap_err().is_rejection());
        assert_eq!(service.state(), ServiceState::Ready);
        assert!(rig.manager.commands().is_empty());

        service.release().await.unwrap();
        assert!(service.release().await.unwrap_err().is_rejection());
    }

    #[tokio::test]
    async fn test_open_timeout_and_rejection() {
        let rig = rig();
        let service = &rig.service;
        service.create().await.unwrap();

        rig.manager.script(RadioCommand::RxOpen, SimReply::Ignore);
        let err = service.open(rx_config()).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(service.state(), ServiceState::Ready);
        assert!(!rig.sim.is_attached(RADIO));

        rig.manager.script(RadioCommand::RxOpen, SimReply::Reject);
        let err = service.open(rx_config()).await.unwrap_err();
        assert!(err.is_rejection() && !err.is_timeout());
        assert_eq!(service.state(), ServiceState::Ready);

        rig.manager.script(RadioCommand::RxOpen, SimReply::Accept);
        service.open(rx_config()).await.unwrap();
        assert_eq!(service.state(), ServiceState::Open);
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_ready() {
        let rig = rig();
        let service = &rig.service;
        service.create().await.unwrap();
        rig.sim.fail_next_attach(RADIO);

        assert!(matches!(service.open(rx_config()).await, Err(ServiceError::Hal(_))));
        assert_eq!(service.state(), ServiceState::Ready);
        assert!(rig.manager.commands().is_empty());
        service.open(rx_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_decoder_waits_for_ack() {
        let silent = Arc::new(SilentDecoder::default());
        let rig = rig_with(silent.clone());
        let service = &rig.service;
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, None).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), service.start_decoder()).await;
        assert!(pending.is_err());
        assert_eq!(service.state(), ServiceState::Pause);
        assert_eq!(silent.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decoder_exit_fails_start() {
        let rig = rig_with(Arc::new(DyingDecoder));
        let service = &rig.service;
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, None).await.unwrap();

        let started = tokio::time::timeout(Duration::from_secs(2), service.start_decoder())
            .await
            .expect("start decoder still waiting after the decoder exited");
        assert!(matches!(started, Err(ServiceError::Resource { .. })));
        assert_eq!(service.state(), ServiceState::Pause);

        // Session lock was released, teardown still works
        to_idle(service).await;
    }

    #[tokio::test]
    async fn test_release_does_not_block_runtime() {
        let rig = rig();
        let service = &rig.service;
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let callback: FrameCallback = Arc::new(move |_: &FrameBuffer| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        });
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, Some(callback)).await.unwrap();

        let mut frame = service.acquire_frame(Duration::from_millis(10)).unwrap();
        for byte in aprs_frame("N0CALL", 0, b">slow") {
            frame.store(byte).unwrap();
        }
        service.dispatch_frame(frame);
        assert_eq!(service.callbacks_outstanding(), 1);

        service.disable_reception().await.unwrap();
        service.close().await.unwrap();

        // The callback only finishes once this task has run
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
                let _ = gate_tx.send(());
            }
        });

        let started = std::time::Instant::now();
        service.release().await.unwrap();
        ticker.await.unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.callbacks_outstanding(), 0);
        assert_eq!(service.state(), ServiceState::Idle);
    }

    #[tokio::test]
    async fn test_close_repeats_from_close() {
        let rig = rig();
        let service = &rig.service;
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, None).await.unwrap();
        service.disable_reception().await.unwrap();

        rig.manager.script(RadioCommand::RxClose, SimReply::Reject);
        assert!(service.close().await.is_err());
        assert_eq!(service.state(), ServiceState::Close);

        rig.manager.script(RadioCommand::RxClose, SimReply::Accept);
        service.close().await.unwrap();
        assert_eq!(service.state(), ServiceState::Ready);
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let rig = rig();
        assert!(matches!(rig.service.hibernate().await, Err(ServiceError::Unsupported(_))));
        assert!(matches!(rig.service.wake().await, Err(ServiceError::Unsupported(_))));
        assert_eq!(rig.service.state(), ServiceState::Idle);
    }

    #[tokio::test]
    async fn test_fsk_decoder_unsupported() {
        let rig = rig();
        rig.sim.set_encoding(RADIO, Encoding::Fsk2);
        let service = &rig.service;
        service.create().await.unwrap();
        service.open(rx_config()).await.unwrap();
        service.enable_reception(0, 0, None).await.unwrap();

        assert!(matches!(service.start_decoder().await, Err(ServiceError::Unsupported(_))));
        assert_eq!(service.state(), ServiceState::Pause);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_packet_to_pull_queue() {
        let rig = rig();
        let service = &rig.service;
        to_decode(service, None).await;
        let capture = service.capture().await.unwrap();

        let frame = aprs_frame("N0CALL", 0, b">hello");
        send_packet(&rig.sim, service, &capture, &frame);

        let received = service.receive_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(received.data(), frame.as_slice());
        assert_eq!(received.status(), FrameStatus::FRAME_RDY);
        assert!(service.try_receive_frame().is_none());
        drop(received);

        let stats = service.stats();
        assert_eq!((stats.sync, stats.frames, stats.valid, stats.good), (1, 1, 1, 1));
        to_idle(service).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_packet_to_callback() {
        let rig = rig();
        let service = &rig.service;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: FrameCallback = Arc::new(move |frame: &FrameBuffer| {
            assert_eq!(frame.status(), FrameStatus::FRAME_RDY);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        to_decode(service, Some(callback)).await;
        let capture = service.capture().await.unwrap();

        send_packet(&rig.sim, service, &capture, &aprs_frame("N0CALL", 0, b">cb"));
        wait_until(|| calls.load(Ordering::SeqCst) == 1 && service.callbacks_outstanding() == 0);
        assert!(service.try_receive_frame().is_none());
        to_idle(service).await;
    }

    #[tokio::test]
    async fn test_acquire_frame_needs_pool() {
        let rig = rig();
        let service = &rig.service;
        assert!(service.acquire_frame(Duration::from_millis(1)).is_err());
        service.create().await.unwrap();
        let frame = service.acquire_frame(Duration::from_millis(1)).unwrap();
        assert_eq!(frame.radio(), RADIO);
    }
}
