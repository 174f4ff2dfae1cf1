//! Structured telemetry for contract violations.
//!
//! Violations are structured data rather than bare log lines. They can be
//!
//! - logged via tracing (the default, through [`TracingObserver`]),
//! - collected programmatically for testing (through [`CollectingObserver`]),
//! - sent to custom observers implementing [`ViolationObserver`].
//!
//! # Example
//!
//! ```
//! use lockstep_rollback::telemetry::{
//!     CollectingObserver, ContractViolation, ViolationKind, ViolationObserver, ViolationSeverity,
//! };
//!
//! let observer = CollectingObserver::new();
//! observer.on_violation(&ContractViolation::new(
//!     ViolationSeverity::Warning,
//!     ViolationKind::InputQueue,
//!     "gap in input sequence",
//!     "input_queue.rs:1",
//! ));
//! assert!(observer.has_violation(ViolationKind::InputQueue));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<Frame>` as a plain integer, or `null` for `None` and [`Frame::NULL`].
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            None => serializer.serialize_none(),
            Some(f) if f.is_null() => serializer.serialize_none(),
            Some(f) => serializer.serialize_i32(f.as_i32()),
        }
    }
}

/// Severity of a contract violation. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable - operation continued with fallback.
    Warning,
    /// Serious issue - the operation was refused.
    Error,
    /// Critical invariant broken - state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
///
/// Marked `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Frame counters disagree, e.g. a snapshot carries the wrong frame.
    FrameSync,
    /// Input queue contract broken, e.g. a gap in the input sequence.
    InputQueue,
    /// Snapshot save/load went wrong.
    StateManagement,
    /// Unexpected protocol traffic, e.g. a reply to a request that was never sent.
    NetworkProtocol,
    /// A message could not be delivered to a handler.
    Routing,
    /// Invalid configuration values.
    Configuration,
    /// Internal logic error.
    InternalError,
    /// A checked invariant failed (see [`InvariantChecker`]).
    Invariant,
    /// Handshake trouble such as excessive retries.
    Synchronization,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputQueue => "input_queue",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::Routing => "routing",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
            Self::Synchronization => "synchronization",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded contract violation.
///
/// The frame field is serialized as `null` for [`Frame::NULL`], or as an
/// integer for valid frames.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContractViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The category/subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The frame at which the violation occurred, if applicable.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ContractViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    ///
    /// ```
    /// use lockstep_rollback::telemetry::{ContractViolation, ViolationKind, ViolationSeverity};
    /// use lockstep_rollback::Frame;
    ///
    /// let violation = ContractViolation::new(
    ///     ViolationSeverity::Warning,
    ///     ViolationKind::FrameSync,
    ///     "test",
    ///     "test.rs:1",
    /// )
    /// .with_frame(Frame::new(42));
    ///
    /// let json = violation.to_json().unwrap();
    /// assert!(json.contains(r#""frame":42"#));
    /// ```
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Trait for observing contract violations.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ContractViolation);
}

/// Trait for observing contract violations.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ContractViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// `Warning` maps to `tracing::warn!`, `Error` and `Critical` map to `tracing::error!`.
/// All fields are emitted as structured tracing fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        match frame {
            None => "null".to_owned(),
            Some(f) if f.is_null() => "null".to_owned(),
            Some(f) => f.as_i32().to_string(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);
        let context_str = if violation.context.is_empty() {
            "{}".to_owned()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Built-in observer that collects violations for testing.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ContractViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ContractViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if a violation of the given kind was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Discards everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a contract violation through the default [`TracingObserver`].
///
/// ```
/// use lockstep_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// let expected = 10;
/// let actual = 15;
/// report_violation!(ViolationSeverity::Warning, ViolationKind::FrameSync,
///     "frame mismatch: expected={}, actual={}", expected, actual);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Hands a violation to `observer`, or to a [`TracingObserver`] if there is none.
///
/// ```
/// use lockstep_rollback::telemetry::{
///     report_to_observer, CollectingObserver, ContractViolation, ViolationKind, ViolationSeverity,
/// };
/// use std::sync::Arc;
///
/// let observer = Arc::new(CollectingObserver::new());
/// let violation = ContractViolation::new(
///     ViolationSeverity::Error,
///     ViolationKind::NetworkProtocol,
///     "reply too large",
///     "session.rs:1",
/// );
/// report_to_observer(Some(&observer), &violation);
/// assert_eq!(observer.len(), 1);
///
/// report_to_observer(None::<&Arc<CollectingObserver>>, &violation);
/// assert_eq!(observer.len(), 1);
/// ```
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ContractViolation,
) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Like [`report_violation!`], but reports to an `Option<Arc<_>>` observer first and
/// only falls back to [`TracingObserver`] when it is `None`.
///
/// ```
/// use lockstep_rollback::report_violation_to;
/// use lockstep_rollback::telemetry::{
///     CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::FrameSync,
///     "frame mismatch: expected={}, actual={}", 10, 15);
/// assert!(collector.has_violation(ViolationKind::FrameSync));
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Result of a failed invariant check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Trait for types that maintain internal invariants.
///
/// Checked by [`debug_check_invariants!`] in debug builds or with the `paranoid` feature.
pub trait InvariantChecker {
    /// Returns `Ok(())` if all invariants hold, or the first broken one.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with `paranoid`) and reports failures as critical violations.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{}",
                violation
            );
        }
    }};

    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid` feature.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{}};
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ViolationKind::InputQueue.as_str(), "input_queue");
        assert_eq!(ViolationKind::Routing.to_string(), "routing");
    }

    #[test]
    fn violation_display_includes_frame_and_context() {
        let violation = ContractViolation::new(
            ViolationSeverity::Error,
            ViolationKind::StateManagement,
            "snapshot missing",
            "sync_layer.rs:10",
        )
        .with_frame(Frame::new(12))
        .with_context("log_len", "10");

        let text = violation.to_string();
        assert!(text.contains("[error/state_management] snapshot missing"));
        assert!(text.contains("frame=12"));
        assert!(text.contains("log_len"));
    }

    #[test]
    fn collecting_observer_collects_and_clears() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        observer.on_violation(&ContractViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::Routing,
            "unrouted",
            "router.rs:1",
        ));
        assert_eq!(observer.len(), 1);
        assert!(observer.has_violation(ViolationKind::Routing));
        assert!(!observer.has_violation(ViolationKind::InputQueue));
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn invariant_violation_display() {
        let violation =
            InvariantViolation::new("PredictionQueue", "length exceeds capacity").with_details("length=130");
        assert_eq!(
            violation.to_string(),
            "PredictionQueue: length exceeds capacity (length=130)"
        );
    }

    #[test]
    fn report_violation_macro_accepts_format_args() {
        let frame = Frame::new(3);
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "unexpected frame {}",
            frame
        );
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "plain message"
        );
    }

    #[test]
    fn report_violation_to_prefers_the_given_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "reply of {} bytes dropped",
            70_000
        );
        report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Routing, "plain");
        let collected = collector.violations();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].message, "reply of 70000 bytes dropped");
        assert_eq!(collected[0].severity, ViolationSeverity::Error);
        assert!(collected[0].location.contains("telemetry.rs"));

        let nobody: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(&nobody, ViolationSeverity::Warning, ViolationKind::Routing, "logged");
        assert_eq!(collector.len(), 2);
    }

    #[cfg(feature = "json")]
    #[test]
    fn null_frame_serializes_as_null() {
        let violation = ContractViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "x",
            "y",
        )
        .with_frame(Frame::NULL);
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""frame":null"#));
    }
}
