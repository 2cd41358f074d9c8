//! Structured reporting of conditions a healthy session never hits.
//!
//! A later batch contradicting an already confirmed frame, a replay that could not be
//! undone, a tick function that does not reproduce its own output: none of these are
//! returned as errors to the caller, but each is worth more than a log line. They are
//! built as [`Violation`]s and handed to a [`ViolationObserver`]. Sessions use the one set
//! with [`SessionBuilder::with_violation_observer`](crate::SessionBuilder::with_violation_observer)
//! and fall back to [`TracingObserver`].
//!
//! ```
//! use lockstep_rollback::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // hand `observer.clone()` to the session builder, run the session, then:
//! assert!(!observer.has_violation(ViolationKind::Resync));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Frame;

/// How bad a violation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Offending input was discarded; the session is still consistent.
    Error,
    /// The session's own state can no longer be trusted.
    Critical,
}

impl ViolationSeverity {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Which part of the crate noticed the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Authoritative input for some frames is lost for good.
    FrameSync,
    /// The history could not be put back together.
    History,
    /// A batch disagreed with a frame that was already confirmed.
    Resync,
    /// Re-simulating a frame gave a different state than the first run.
    Determinism,
    /// A runtime [`InvariantChecker`] check failed.
    Invariant,
}

impl ViolationKind {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::History => "history",
            Self::Resync => "resync",
            Self::Determinism => "determinism",
            Self::Invariant => "invariant",
        }
    }
}

/// One reported violation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it was noticed.
    pub kind: ViolationKind,
    /// What happened.
    pub message: String,
    /// `file:line` of the reporting call.
    pub location: &'static str,
    /// The frame concerned, if any.
    pub frame: Option<Frame>,
    /// Extra key/value diagnostics, sorted by key.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a violation without frame or context.
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

    /// Attaches the frame concerned.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Attaches one diagnostic value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Renders the violation as one JSON object.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} ({}",
            self.severity.as_str(),
            self.kind.as_str(),
            self.message,
            self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame {frame}")?;
        }
        for (key, value) in &self.context {
            write!(f, ", {key}={value}")?;
        }
        f.write_str(")")
    }
}

/// Receives violations as they are detected.
///
/// Called synchronously from inside `sync` and `speculate_tick`, so keep it short.
pub trait ViolationObserver: Send + Sync {
    /// Called once per violation.
    fn on_violation(&self, violation: &Violation);
}

/// The default sink: one `tracing` event per violation.
///
/// `Error` is logged with `warn!` because the session carries on; `Critical` with `error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let frame = violation.frame.map(Frame::as_i32);
        match violation.severity {
            ViolationSeverity::Error => tracing::warn!(
                kind = violation.kind.as_str(),
                location = violation.location,
                ?frame,
                context = ?violation.context,
                "{}",
                violation.message
            ),
            ViolationSeverity::Critical => tracing::error!(
                kind = violation.kind.as_str(),
                location = violation.location,
                ?frame,
                context = ?violation.context,
                "{}",
                violation.message
            ),
        }
    }
}

/// Keeps every violation it sees, for assertions in tests.
///
/// ```
/// use lockstep_rollback::telemetry::{
///     CollectingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&Violation::new(
///     ViolationSeverity::Error,
///     ViolationKind::Resync,
///     "confirmed frame contradicted",
///     "game.rs:10",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::Resync));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    seen: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// An observer that has seen nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything seen so far, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.seen.lock().clone()
    }

    /// How many violations were seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// `true` until the first violation arrives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Whether a violation of `kind` was seen.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.seen.lock().iter().any(|violation| violation.kind == kind)
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.seen.lock().push(violation.clone());
    }
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer(observer: Option<&Arc<dyn ViolationObserver>>, violation: &Violation) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Builds a [`Violation`] tagged with the call site and reports it through
/// [`report_to_observer`].
///
/// The first argument is an `Option<&Arc<dyn ViolationObserver>>`.
///
/// ```
/// use lockstep_rollback::report_violation;
/// use lockstep_rollback::telemetry::{ViolationKind, ViolationSeverity};
///
/// report_violation!(None, ViolationSeverity::Error, ViolationKind::Resync,
///     "frame {} contradicted", 12);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($observer:expr, $severity:expr, $kind:expr, $($message:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($($message)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer, &violation);
    }};
}

/// Fails the test if the observer saw anything.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "expected no violations, got {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// A broken invariant: which type, which rule, and optionally the values involved.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvariantViolation {
    /// The type whose invariant broke.
    pub type_name: &'static str,
    /// The rule that broke.
    pub invariant: String,
    /// The values involved.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a violation of `invariant` in `type_name`.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Attaches the values involved.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        match &self.details {
            Some(details) => write!(f, " ({details})"),
            None => Ok(()),
        }
    }
}

/// Types whose internal consistency can be checked at runtime.
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Runs [`InvariantChecker::check_invariants`] on the first argument and reports a failure
/// as a `Critical` [`ViolationKind::Invariant`] to the given observer.
///
/// Active in debug builds and with the `paranoid` feature; expands to nothing otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($target:expr, $observer:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(broken) = $target.check_invariants() {
            $crate::report_violation!(
                $observer,
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [{}]",
                broken,
                $context
            );
        }
    }};
}

/// Release builds without `paranoid`: no checks.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($target:expr, $observer:expr, $context:expr) => {{}};
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

    fn violation(severity: ViolationSeverity, kind: ViolationKind) -> Violation {
        Violation::new(severity, kind, "frame contradicted", "resync.rs:7")
    }

    #[test]
    fn display_lists_frame_and_context_in_key_order() {
        let rendered = violation(ViolationSeverity::Error, ViolationKind::Resync)
            .with_frame(Frame::new(7))
            .with_context("stored", "[1, 2]")
            .with_context("received", "[1, 3]")
            .to_string();
        assert_eq!(
            rendered,
            "error resync: frame contradicted (resync.rs:7, frame 7, received=[1, 3], stored=[1, 2])"
        );
    }

    #[test]
    fn collecting_observer_keeps_order_and_kinds() {
        let observer = CollectingObserver::new();
        assert!(observer.is_empty());
        observer.on_violation(&violation(ViolationSeverity::Error, ViolationKind::Resync));
        observer.on_violation(&violation(ViolationSeverity::Critical, ViolationKind::History));
        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::History));
        assert!(!observer.has_violation(ViolationKind::FrameSync));
        assert_eq!(observer.violations()[0].kind, ViolationKind::Resync);
    }

    #[test]
    fn report_violation_goes_to_the_given_observer_only() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Arc<dyn ViolationObserver> = collector.clone();
        report_violation!(
            Some(&observer),
            ViolationSeverity::Critical,
            ViolationKind::Determinism,
            "frame {} drifted",
            4
        );
        report_violation!(
            None,
            ViolationSeverity::Error,
            ViolationKind::Resync,
            "logged, not collected"
        );
        let seen = collector.violations();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "frame 4 drifted");
        assert!(seen[0].location.contains("telemetry.rs:"));
    }

    #[cfg(any(debug_assertions, feature = "paranoid"))]
    #[test]
    fn invariant_failures_reach_the_observer() {
        struct Broken;

        impl InvariantChecker for Broken {
            fn check_invariants(&self) -> Result<(), InvariantViolation> {
                Err(InvariantViolation::new("Broken", "always").with_details("x=1"))
            }
        }

        let collector = Arc::new(CollectingObserver::new());
        let observer: Arc<dyn ViolationObserver> = collector.clone();
        crate::debug_check_invariants!(Broken, Some(&observer), "unit test");
        let seen = collector.violations();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ViolationKind::Invariant);
        assert_eq!(seen[0].message, "Broken: always (x=1) [unit test]");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_has_plain_frame_number() {
        let json = violation(ViolationSeverity::Error, ViolationKind::Resync)
            .with_frame(Frame::new(12))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""frame":12"#));
        assert!(json.contains(r#""kind":"resync""#));
    }
}
