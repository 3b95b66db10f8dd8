//! Packet receive demo
//!
//! Runs the receive pipeline against simulated radio hardware: opens a
//! receive session, plays a few packets through the capture channel
//! (one of them corrupted), and prints what the consumer saw.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pkt_receive::ax25::FrameView;
use pkt_receive::buffer::{FrameBuffer, FrameCallback};
use pkt_receive::capture::{CaptureChannel, ChannelState};
use pkt_receive::decoder::ThreadedDecoder;
use pkt_receive::diag::TraceListener;
use pkt_receive::hal::RxConfig;
use pkt_receive::service::{ServicePorts, ThreadSpawner};
use pkt_receive::sim::{aprs_frame, frame_pulses, ByteDemod, SimManager, SimRadio};
use pkt_receive::{Config, Encoding, RadioId, ServiceRegistry};

/// Play one packet: raise CCA, wait for the stream, send pulses, drop CCA
async fn play_packet(sim: &SimRadio, capture: &CaptureChannel, radio: RadioId, frame: &[u8]) {
    sim.set_cca(radio, true);
    for _ in 0..100 {
        if capture.state() == ChannelState::Active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    if capture.state() != ChannelState::Active {
        warn!("Radio {} stream did not open", radio);
    }
    for (width, period) in frame_pulses(frame) {
        sim.pulse(radio, width, period);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    sim.set_cca(radio, false);
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   Packet receive pipeline (simulated)");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Radios: {}", config.radios);
    info!("  RX buffers: {}", config.rx_buffers);
    info!("  Common buffers: {}", config.common_buffers);
    info!(
        "  Pulse streams: {} ({} segments x {})",
        config.pulse_streams, config.pulse_segments, config.pulse_segment_len
    );
    info!("  Frequency: {} Hz", config.rx_frequency);

    let sim = SimRadio::new();
    let manager = SimManager::spawn(16);
    let ports = ServicePorts {
        hal: sim.clone(),
        commander: manager.commander(config.command_timeout()),
        decoder: Arc::new(ThreadedDecoder::new(|| Box::new(ByteDemod::default()))),
        spawner: Arc::new(ThreadSpawner),
    };
    let registry = ServiceRegistry::new(&config, ports);

    let radio = RadioId(1);
    let service = registry.service(radio).context("Radio 1 not registered")?;
    let trace = TraceListener::spawn(service.events().clone()).context("Failed to start trace listener")?;

    let callback: FrameCallback = Arc::new(|frame: &FrameBuffer| match FrameView::parse(frame.data()) {
        Ok(view) => info!(
            "RX {} [{}] {:?}: {}",
            frame.radio(),
            frame.received_at().format("%H:%M:%S%.3f"),
            frame.status(),
            view
        ),
        Err(e) => info!("RX {} {:?}: unparsable ({:?})", frame.radio(), frame.status(), e),
    });

    service.create().await.context("Failed to create packet service")?;
    service
        .open(RxConfig {
            encoding: Encoding::Afsk,
            base_frequency: config.rx_frequency,
            step_hz: 12_500,
            channel: 0,
            squelch: 0,
        })
        .await
        .context("Failed to open receive")?;
    service
        .enable_reception(0, 0x20, Some(callback))
        .await
        .context("Failed to enable reception")?;
    service.start_decoder().await.context("Failed to start decoder")?;

    let capture = service.capture().await.context("No capture channel after open")?;
    let mut corrupted = aprs_frame("N0CALL", 2, b">corrupted");
    if let Some(byte) = corrupted.get_mut(20) {
        *byte ^= 0x08;
    }
    let packets = [
        aprs_frame("N0CALL", 0, b"!4903.50N/07201.75W-Test"),
        corrupted,
        aprs_frame("N0CALL", 9, b">status"),
    ];
    for packet in &packets {
        play_packet(&sim, &capture, radio, packet).await;
    }

    // Let callbacks finish
    for _ in 0..50 {
        if service.callbacks_outstanding() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.stop_decoder().await.context("Failed to stop decoder")?;
    service.disable_reception().await.context("Failed to disable reception")?;
    service.close().await.context("Failed to close receive")?;

    let status = service.status();
    let capture_stats = capture.stats().snapshot();
    drop(capture);
    service.release().await.context("Failed to release packet service")?;

    info!("Service: {}", serde_json::to_string(&status)?);
    info!("Capture: {}", serde_json::to_string(&capture_stats)?);

    let mut beacon = registry
        .allocate_tx_buffer(Some(Duration::from_millis(100)))
        .await
        .context("No transmit buffer")?;
    beacon.extend_from_slice(&aprs_frame("N0CALL", 0, b">beacon"));
    info!("Transmit buffer holds {} bytes: {}", beacon.len(), hex::encode_upper(&beacon[..]));
    drop(beacon);
    registry.shutdown().await;

    trace.stop();
    info!("Done");
    Ok(())
}
