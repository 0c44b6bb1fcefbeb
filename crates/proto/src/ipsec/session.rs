//! Session: an SA bound to its crypto or security handles
//!
//! A [`Session`] is what batches run against. The prepare/process pair was
//! chosen when the SA was built; the session only supplies the handles the
//! pair needs and dispatches with a `match`.
//!
//! # Example
//!
//! ```
//! use corvid_platform::{CryptoOp, Mbuf};
//! use corvid_proto::ipsec::{
//!     crypto::{AeadAlgorithm, CryptoDirection, CryptoXform, SoftCryptoDevice},
//!     Direction, Mode, Sa, SaParams, Session, SessionBinding,
//! };
//!
//! # fn main() -> corvid_proto::ipsec::Result<()> {
//! let xform = CryptoXform::aead(AeadAlgorithm::AesGcm, &[7; 16], false);
//! let params = SaParams::builder()
//!     .with_spi(0x1000)
//!     .with_direction(Direction::Outbound)
//!     .with_mode(Mode::Transport)
//!     .with_crypto(xform.clone())
//!     .build()?;
//! let sa = Sa::new(&params)?;
//!
//! let dev = SoftCryptoDevice::new();
//! let handle = dev.create_session(&xform, CryptoDirection::Encrypt)?;
//! let session = Session::new(&sa, SessionBinding::Crypto(handle))?;
//!
//! let mut ip = vec![0u8; 40];
//! ip[0] = 0x45;
//! ip[9] = 17;
//! let mut mbufs = vec![Mbuf::from_bytes(&ip, 64, 64).with_header_lens(0, 20)];
//! let mut ops = CryptoOp::batch(mbufs.len(), 0);
//!
//! let out = session.run(&dev, &mut mbufs, &mut ops)?;
//! assert_eq!(out.accepted, 1);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use corvid_platform::{
    CryptoDevice, CryptoOp, CryptoSessionHandle, Mbuf, OffloadFlags, SecurityContext,
    SecuritySessionHandle, SessionAttach,
};

use super::batch::{crypto_group, BatchOutcome, Rejects};
use super::config::ActionType;
use super::sa::{PrepareKind, ProcessKind, Sa};
use super::{inbound, logging, outbound, Error, Result};

/// Handles a session is bound with
#[derive(Clone, Copy)]
pub enum SessionBinding<'a> {
    /// Crypto device session, for [`ActionType::LookasideNone`]
    Crypto(CryptoSessionHandle),
    /// Security session, for the offload strategies
    Security {
        /// Session on the NIC or accelerator
        session: SecuritySessionHandle,
        /// Context that attaches packet metadata; required inline
        ctx: Option<&'a dyn SecurityContext>,
    },
}

impl fmt::Debug for SessionBinding<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionBinding::Crypto(h) => f.debug_tuple("Crypto").field(h).finish(),
            SessionBinding::Security { session, ctx } => f
                .debug_struct("Security")
                .field("session", session)
                .field("ctx", &ctx.is_some())
                .finish(),
        }
    }
}

/// Security context plus session used to mark packets for inline offload
#[derive(Clone, Copy)]
pub(crate) struct Offload<'a> {
    ctx: &'a dyn SecurityContext,
    session: SecuritySessionHandle,
}

impl Offload<'_> {
    /// Flag `mb` for transmit offload and attach metadata if the NIC wants it
    pub(crate) fn mark(&self, mb: &mut Mbuf) {
        mb.ol_flags.insert(OffloadFlags::TX_SEC_OFFLOAD);
        if self.ctx.needs_pkt_metadata() {
            self.ctx.set_pkt_metadata(self.session, mb);
        }
    }
}

/// An SA bound to the handles its processing strategy needs
pub struct Session<'a> {
    sa: &'a Sa,
    attach: SessionAttach,
    offload: Option<Offload<'a>>,
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("spi", &format_args!("{:#010x}", self.sa.spi))
            .field("action", &self.sa.action)
            .field("attach", &self.attach)
            .field("offload", &self.offload.is_some())
            .finish()
    }
}

impl<'a> Session<'a> {
    /// Bind `sa` to `binding`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the binding does not fit the
    /// SA's action type: lookaside crypto needs a crypto session, the
    /// offload strategies a security session, and the inline strategies a
    /// security context as well.
    pub fn new(sa: &'a Sa, binding: SessionBinding<'a>) -> Result<Self> {
        let action = sa.action;
        let (attach, offload) = match (action, binding) {
            (ActionType::LookasideNone, SessionBinding::Crypto(h)) => {
                (SessionAttach::Crypto(h), None)
            }
            (ActionType::LookasideProtocol, SessionBinding::Security { session, .. }) => {
                (SessionAttach::Security(session), None)
            }
            (
                ActionType::InlineCrypto | ActionType::InlineProtocol,
                SessionBinding::Security {
                    session,
                    ctx: Some(ctx),
                },
            ) => (
                SessionAttach::Security(session),
                Some(Offload { ctx, session }),
            ),
            (action, binding) => {
                return Err(Error::InvalidParameter(format!(
                    "{} SA cannot be bound to {:?}",
                    action_name(action),
                    binding
                )))
            }
        };

        let handle = match attach {
            SessionAttach::Crypto(h) => h.0,
            SessionAttach::Security(h) => h.0,
        };
        logging::log_session_bound(sa.spi, action_name(action), handle);

        Ok(Session {
            sa,
            attach,
            offload,
        })
    }

    /// SA this session runs against
    pub fn sa(&self) -> &'a Sa {
        self.sa
    }

    /// Handle attached to every crypto op
    pub fn attach(&self) -> SessionAttach {
        self.attach
    }

    /// Whether the strategy has a prepare stage
    pub fn has_prepare(&self) -> bool {
        self.sa.prepare != PrepareKind::None
    }

    /// Prepare `mbufs` and fill one crypto op per accepted packet
    ///
    /// On return the `accepted` packets sit at the front of `mbufs` in their
    /// original order with `ops[..accepted]` describing them; rejected
    /// packets follow in their original order.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] if the strategy has no prepare stage
    /// - [`Error::InvalidParameter`] if `ops` is shorter than `mbufs`
    pub fn prepare(&self, mbufs: &mut [Mbuf], ops: &mut [CryptoOp]) -> Result<BatchOutcome> {
        if ops.len() < mbufs.len() {
            return Err(Error::InvalidParameter(format!(
                "{} ops for {} packets",
                ops.len(),
                mbufs.len()
            )));
        }

        let sa = self.sa;
        let outcome = match sa.prepare {
            PrepareKind::None => {
                return Err(Error::NotSupported(format!(
                    "prepare for {} SA",
                    action_name(sa.action)
                )))
            }
            PrepareKind::OutboundTunnel => outbound::prepare(sa, self.attach, mbufs, ops, true)?,
            PrepareKind::OutboundTransport => {
                outbound::prepare(sa, self.attach, mbufs, ops, false)?
            }
            PrepareKind::Inbound => inbound::prepare(sa, self.attach, mbufs, ops),
            PrepareKind::SecuritySession => {
                for op in ops.iter_mut().take(mbufs.len()) {
                    op.reset(self.attach);
                }
                BatchOutcome {
                    accepted: mbufs.len(),
                    error: None,
                }
            }
        };

        logging::log_batch("prepare", sa.spi, mbufs.len(), outcome.accepted);
        Ok(outcome)
    }

    /// Finish `mbufs` after crypto (or arriving from an inline NIC)
    ///
    /// Accepted packets are moved to the front, rejected ones to the tail,
    /// each group in original order.
    pub fn process(&self, mbufs: &mut [Mbuf]) -> BatchOutcome {
        let sa = self.sa;
        let outcome = match (sa.process, self.offload.as_ref()) {
            (ProcessKind::OutboundSqh, _) => outbound::process(sa, mbufs, true),
            (ProcessKind::CheckFlags, _) => check_flags(sa, mbufs),
            (ProcessKind::Inbound { tunnel, inline }, _) => {
                inbound::process(sa, mbufs, tunnel, inline)
            }
            (ProcessKind::InlineOutbound { tunnel }, Some(offload)) => {
                outbound::process_inline(sa, offload, mbufs, tunnel)
            }
            (ProcessKind::InlineProtocolOutbound, Some(offload)) => {
                outbound::process_inline_protocol(sa, offload, mbufs)
            }
            (ProcessKind::InlineOutbound { .. } | ProcessKind::InlineProtocolOutbound, None) => {
                let err = Error::InvalidState("inline SA without security context".into());
                let mut rejects = Rejects::new();
                for i in 0..mbufs.len() {
                    rejects.push(i, err.clone());
                }
                rejects.finish(mbufs)
            }
        };

        logging::log_batch("process", sa.spi, mbufs.len(), outcome.accepted);
        outcome
    }

    /// Run a whole batch: prepare, execute on `dev`, process
    ///
    /// Packets rejected by prepare stay at the very end of `mbufs`, behind
    /// the ones rejected by process. The reported error is the first one
    /// raised, prepare errors first.
    ///
    /// # Errors
    ///
    /// Same as [`Session::prepare`], except that strategies without a
    /// prepare stage go straight to process.
    pub fn run(
        &self,
        dev: &dyn CryptoDevice,
        mbufs: &mut [Mbuf],
        ops: &mut [CryptoOp],
    ) -> Result<BatchOutcome> {
        if !self.has_prepare() {
            return Ok(self.process(mbufs));
        }

        let prepared = self.prepare(mbufs, ops)?;
        let k = prepared.accepted;

        dev.process(&mut ops[..k], &mut mbufs[..k]);
        crypto_group(&ops[..k], &mut mbufs[..k])?;

        let processed = self.process(&mut mbufs[..k]);
        Ok(BatchOutcome {
            accepted: processed.accepted,
            error: prepared.error.or(processed.error),
        })
    }
}

/// Accept packets whose offload succeeded
fn check_flags(sa: &Sa, mbufs: &mut [Mbuf]) -> BatchOutcome {
    let mut rejects = Rejects::new();
    let mut bytes = 0;

    for (i, mb) in mbufs.iter().enumerate() {
        if mb.ol_flags.contains(OffloadFlags::RX_SEC_OFFLOAD_FAILED) {
            let err = Error::OffloadFailed;
            logging::log_packet_rejected("check_flags", sa.spi, i, &err);
            sa.stats.record_auth_failed(1);
            rejects.push(i, err);
        } else {
            bytes += mb.pkt_len();
        }
    }

    sa.stats.record_accepted(mbufs.len() - rejects.len(), bytes);
    rejects.finish(mbufs)
}

fn action_name(action: ActionType) -> &'static str {
    match action {
        ActionType::LookasideNone => "lookaside-none",
        ActionType::InlineCrypto => "inline-crypto",
        ActionType::InlineProtocol => "inline-protocol",
        ActionType::LookasideProtocol => "lookaside-protocol",
    }
}
