use std::fmt;

/// An event submitted by a check.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Title.
    pub title: String,

    /// Body text.
    pub text: String,

    /// Tags, in `key:value` form.
    pub tags: Vec<String>,

    /// Hostname the event is attributed to.
    pub host: Option<String>,

    /// Unix timestamp, in seconds.
    pub timestamp: u64,
}

/// Status of a service check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceCheckStatus {
    /// The service is healthy.
    Ok,

    /// The service is degraded.
    Warning,

    /// The service is failing.
    Critical,

    /// The status could not be determined.
    Unknown,
}

impl fmt::Display for ServiceCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

/// A service check submitted by a check.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCheck {
    /// Service check name.
    pub name: String,

    /// Status.
    pub status: ServiceCheckStatus,

    /// Tags, in `key:value` form.
    pub tags: Vec<String>,

    /// Hostname the service check is attributed to.
    pub host: Option<String>,

    /// Optional message describing the status.
    pub message: Option<String>,

    /// Unix timestamp, in seconds.
    pub timestamp: u64,
}

/// Non-metric payloads committed by a sender, buffered until the next flush.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckPayload {
    /// An event.
    Event(Event),

    /// A service check.
    ServiceCheck(ServiceCheck),
}
