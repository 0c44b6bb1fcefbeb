//! Structured logging for ESP transforms
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages carry the SPI so events of one SA can be filtered.
//!
//! # Log Levels
//!
//! - **TRACE**: Per-packet rejection reasons
//! - **DEBUG**: Batch summaries, tunnel templates
//! - **INFO**: SA setup and teardown, session binding
//! - **WARN**: Sequence number space exhausted
//!
//! # Example
//!
//! ```no_run
//! use corvid_proto::ipsec::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("corvid_proto::ipsec=debug")
//!     .init();
//!
//! logging::log_batch("inbound_process", 0x1000, 32, 31);
//! ```

use tracing::{debug, info, trace, warn};

use super::Error;

/// Log SA initialization
///
/// # Arguments
///
/// * `spi` - Security Parameter Index
/// * `direction` - "inbound" or "outbound"
/// * `mode` - Encapsulation mode
/// * `algo` - Algorithm layout
/// * `size` - Bytes accounted for the SA
pub fn log_sa_created(spi: u32, direction: &str, mode: &str, algo: &str, size: usize) {
    info!(
        spi = format_args!("{:#010x}", spi),
        direction = direction,
        mode = mode,
        algo = algo,
        size = size,
        "SA initialized"
    );
}

/// Log SA teardown
pub fn log_sa_destroyed(spi: u32) {
    info!(spi = format_args!("{:#010x}", spi), "SA finalized");
}

/// Log a session binding to an SA
///
/// # Arguments
///
/// * `spi` - Security Parameter Index
/// * `action` - Processing strategy
/// * `handle` - Crypto or security session handle
pub fn log_session_bound(spi: u32, action: &str, handle: u64) {
    info!(
        spi = format_args!("{:#010x}", spi),
        action = action,
        handle = handle,
        "Session bound"
    );
}

/// Log the outer header template of an outbound tunnel SA
pub fn log_tunnel_template(spi: u32, template: &[u8]) {
    debug!(
        spi = format_args!("{:#010x}", spi),
        template = %hex::encode(template),
        "Tunnel header template"
    );
}

/// Log a finished batch
///
/// # Arguments
///
/// * `stage` - Pipeline stage, e.g. "outbound_prepare"
/// * `spi` - Security Parameter Index
/// * `total` - Packets handed in
/// * `accepted` - Packets that passed
pub fn log_batch(stage: &str, spi: u32, total: usize, accepted: usize) {
    debug!(
        stage = stage,
        spi = format_args!("{:#010x}", spi),
        total = total,
        accepted = accepted,
        rejected = total - accepted,
        "Batch processed"
    );
}

/// Log a rejected packet
pub fn log_packet_rejected(stage: &str, spi: u32, index: usize, err: &Error) {
    trace!(
        stage = stage,
        spi = format_args!("{:#010x}", spi),
        index = index,
        error = %err,
        "Packet rejected"
    );
}

/// Log an anti-replay rejection
pub fn log_replay_detected(spi: u32, sqn: u64, err: &Error) {
    trace!(
        spi = format_args!("{:#010x}", spi),
        sqn = sqn,
        error = %err,
        "Replay window rejected packet"
    );
}

/// Log exhaustion of the outbound sequence space
pub fn log_sqn_overflow(spi: u32, requested: usize, granted: usize) {
    warn!(
        spi = format_args!("{:#010x}", spi),
        requested = requested,
        granted = granted,
        "Sequence number space exhausted"
    );
}
