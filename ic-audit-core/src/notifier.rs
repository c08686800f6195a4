//! Client side of the audit pipeline
//!
//! A [`Notifier`] is bound to one project identity and sends audit events to
//! the local collector. Sending is fire-and-forget:
//! - `send` returns immediately and never fails
//! - each event is delivered on its own detached unit of work (a task on the
//!   ambient tokio runtime, or a short-lived thread when there is none)
//! - connect + write are bounded by a sub-second timeout
//! - any failure is logged at debug level and the event is dropped
//!
//! There is no retry, queue, or acknowledgement. Audit logging must never add
//! latency to, or crash, the program that emits it.
//!
//! ```rust,no_run
//! use ic_audit_core::notifier::Notifier;
//! use ic_audit_core::types::{events, privileges, ExtraFields};
//!
//! let notifier = Notifier::new("grid-bot", "crypto", "Grid bot", &[privileges::EXECUTE_TRADE]);
//! notifier.boot();
//!
//! let mut fields = ExtraFields::new();
//! fields.insert("symbol".to_string(), "BTCUSDT".into());
//! fields.insert("price".to_string(), 64250.5.into());
//! notifier.send(events::TRADE_OPENED, "Trade opened for BTCUSDT", fields);
//! ```

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::thread;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use crate::transport;
use crate::types::{events, unix_now, Envelope, ExtraFields, FieldValue, ProjectIdentity, RESERVED_FIELDS};

const BOOT_DESCRIPTION: &str = "Project was booted.";

/// Reusable sender bound to one project identity.
#[derive(Debug, Clone)]
pub struct Notifier {
    identity: ProjectIdentity,
    config: NotifierConfig,
    /// Attached to every event; per-call fields win on collision
    fields: ExtraFields,
}

impl Notifier {
    /// Notifier for the default collector address (`127.0.0.1:9324`).
    pub fn new(
        project_name: impl Into<String>,
        project_market: impl Into<String>,
        project_description: impl Into<String>,
        project_privileges: &[&str],
    ) -> Self {
        let identity = ProjectIdentity::new(
            project_name,
            project_market,
            project_description,
            project_privileges.iter().map(|p| p.to_string()).collect(),
        );
        Self::with_config(identity, NotifierConfig::default())
    }

    pub fn with_config(identity: ProjectIdentity, config: NotifierConfig) -> Self {
        Self {
            identity,
            config,
            fields: ExtraFields::new(),
        }
    }

    /// Attach a field to every event this notifier sends.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Build the envelope `send` would dispatch, stamped with the current time.
    pub fn envelope(
        &self,
        event_type: &str,
        event_description: &str,
        extra_fields: ExtraFields,
    ) -> Envelope {
        let mut merged = self.fields.clone();
        merged.extend(extra_fields);
        merged.retain(|key, _| {
            let reserved = RESERVED_FIELDS.contains(&key.as_str());
            if reserved {
                tracing::debug!(field = %key, "Dropping extra field that shadows an envelope field");
            }
            !reserved
        });

        Envelope::new(
            &self.identity,
            event_type,
            event_description,
            unix_now(),
            merged,
        )
    }

    /// Send an audit event. Returns immediately; never fails.
    pub fn send(&self, event_type: &str, event_description: &str, extra_fields: ExtraFields) {
        let envelope = self.envelope(event_type, event_description, extra_fields);
        self.dispatch(envelope);
    }

    /// Alias for [`Notifier::send`].
    pub fn notify(&self, event_type: &str, event_description: &str, extra_fields: ExtraFields) {
        self.send(event_type, event_description, extra_fields);
    }

    /// Announce that the project started.
    pub fn boot(&self) {
        self.send(events::BOOT, BOOT_DESCRIPTION, ExtraFields::new());
    }

    /// Boot event delivered synchronously on the calling thread.
    pub fn deliver_boot(&self) -> Result<()> {
        let envelope = self.envelope(events::BOOT, BOOT_DESCRIPTION, ExtraFields::new());
        deliver(self.config.address, self.config.timeout(), &envelope)
    }

    /// Deliver a prepared envelope on a detached unit of work.
    pub fn dispatch(&self, envelope: Envelope) {
        let address = self.config.address;
        let timeout = self.config.timeout();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = deliver_async(address, timeout, &envelope).await {
                    log_dropped(&envelope, &e);
                }
            });
            return;
        }

        let spawned = thread::Builder::new()
            .name("ic-audit-notify".to_string())
            .spawn(move || {
                if let Err(e) = deliver(address, timeout, &envelope) {
                    log_dropped(&envelope, &e);
                }
            });
        if let Err(e) = spawned {
            tracing::debug!(error = %e, "Failed to spawn audit sender thread");
        }
    }
}

fn log_dropped(envelope: &Envelope, error: &Error) {
    tracing::debug!(
        project = %envelope.project_name,
        event_type = %envelope.event_type,
        error = %error,
        "Audit event dropped"
    );
}

fn connection_error(address: SocketAddr, error: impl std::fmt::Display) -> Error {
    Error::Connection(format!("{}: {}", address, error))
}

/// Blocking delivery of one envelope.
///
/// Callers that must not fail discard the result.
pub fn deliver(address: SocketAddr, timeout: Duration, envelope: &Envelope) -> Result<()> {
    let frame = transport::encode(envelope)?;

    let mut stream = StdTcpStream::connect_timeout(&address, timeout)
        .map_err(|e| connection_error(address, e))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| connection_error(address, e))?;
    stream
        .write_all(&frame)
        .map_err(|e| connection_error(address, e))?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Async delivery of one envelope, bounded by `timeout` end to end.
pub async fn deliver_async(address: SocketAddr, timeout: Duration, envelope: &Envelope) -> Result<()> {
    let frame = transport::encode(envelope)?;

    let attempt = async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(connection_error(address, e)),
        Err(_) => Err(connection_error(
            address,
            format!("timed out after {:?}", timeout),
        )),
    }
}

/// One-shot helper: announce a boot event for a project and forget about it.
///
/// Outside a tokio runtime the event goes out on a detached thread, which
/// dies with the process. A program that exits right after this call should
/// use [`fast_audit_blocking`] instead.
pub fn fast_audit(
    project_name: impl Into<String>,
    project_market: impl Into<String>,
    project_description: impl Into<String>,
) {
    Notifier::new(project_name, project_market, project_description, &[]).boot();
}

/// Like [`fast_audit`], but delivers on the calling thread.
///
/// Returns once the event is written or the notifier timeout (500 ms by
/// default) has passed. The error is for callers that want to report it.
pub fn fast_audit_blocking(
    project_name: impl Into<String>,
    project_market: impl Into<String>,
    project_description: impl Into<String>,
) -> Result<()> {
    let notifier = Notifier::new(project_name, project_market, project_description, &[]);
    notifier.deliver_boot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameReader;
    use crate::types::privileges;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Instant;

    /// An address nothing listens on.
    fn closed_address() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn notifier_for(address: SocketAddr) -> Notifier {
        Notifier::with_config(
            ProjectIdentity::new(
                "scalper",
                "futures",
                "ES scalper",
                vec![privileges::LIVE_MONITORING.to_string()],
            ),
            NotifierConfig::for_address(address),
        )
    }

    #[test]
    fn test_envelope_carries_identity_and_fields() {
        let notifier = notifier_for(closed_address())
            .with_field("host", "desk-1")
            .with_field("symbol", "default");

        let mut extra = ExtraFields::new();
        extra.insert("symbol".to_string(), "ES".into());
        extra.insert("timestamp".to_string(), 1.0.into());

        let before = unix_now();
        let envelope = notifier.envelope(events::TRADE_OPENED, "opened", extra);

        assert_eq!(envelope.project_name, "scalper");
        assert_eq!(envelope.project_market, "futures");
        assert_eq!(envelope.project_privileges, vec!["live_monitoring"]);
        assert!(envelope.timestamp >= before);
        assert_eq!(envelope.extra_fields["symbol"], FieldValue::from("ES"));
        assert_eq!(envelope.extra_fields["host"], FieldValue::from("desk-1"));
        assert!(!envelope.extra_fields.contains_key("timestamp"));
    }

    #[test]
    fn test_send_to_closed_port_returns_immediately() {
        let notifier = notifier_for(closed_address());
        let started = Instant::now();
        for _ in 0..20 {
            notifier.send(events::ERROR, "collector is down", ExtraFields::new());
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fast_audit_never_blocks() {
        let started = Instant::now();
        fast_audit("script", "none", "one-off script");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_deliver_boot_is_synchronous() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let notifier = notifier_for(listener.local_addr().unwrap());

        notifier.deliver_boot().unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        let envelope = transport::decode(&bytes).unwrap();
        assert_eq!(envelope.event_type, events::BOOT);
        assert_eq!(envelope.event_description, BOOT_DESCRIPTION);

        let closed = notifier_for(closed_address());
        assert!(matches!(closed.deliver_boot(), Err(Error::Connection(_))));
    }

    #[test]
    fn test_deliver_reports_connection_error() {
        let notifier = notifier_for(closed_address());
        let envelope = notifier.envelope(events::BOOT, "up", ExtraFields::new());
        let result = deliver(notifier.config().address, Duration::from_millis(200), &envelope);
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[test]
    fn test_deliver_writes_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let reader = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bytes = Vec::new();
            stream.read_to_end(&mut bytes).unwrap();
            bytes
        });

        let notifier = notifier_for(address);
        let envelope = notifier.envelope(events::BOOT, "up", ExtraFields::new());
        deliver(address, Duration::from_millis(500), &envelope).unwrap();

        let bytes = reader.join().unwrap();
        assert_eq!(transport::decode(&bytes).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_send_inside_runtime_uses_task() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notifier = notifier_for(listener.local_addr().unwrap());

        notifier.send(events::TRADE_CLOSED, "closed", ExtraFields::new());

        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut frames = FrameReader::new(stream, 4096);
        let envelope = frames.next_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.event_type, "trade_closed");
        assert_eq!(envelope.project_name, "scalper");
    }

    #[tokio::test]
    async fn test_deliver_async_times_out_on_closed_port() {
        let envelope = notifier_for(closed_address()).envelope(events::BOOT, "up", ExtraFields::new());
        let started = Instant::now();
        let result = deliver_async(closed_address(), Duration::from_millis(300), &envelope).await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
