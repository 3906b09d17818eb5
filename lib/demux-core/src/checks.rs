//! Check producers.
//!
//! A check runs some arbitrary chunk of logic and submits what it observes through its [`Sender`].
use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::{debug, error};

use crate::{sender::Sender, task::spawn_traced};

/// A check error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CheckError {
    /// The check is not available on this platform or build.
    #[snafu(display("Check '{}' is not implemented.", check))]
    NotImplemented {
        /// Check name.
        check: String,
    },

    /// The check ran but failed.
    #[snafu(display("Check '{}' failed: {}", check, reason))]
    Failed {
        /// Check name.
        check: String,

        /// Failure reason.
        reason: String,
    },

    /// The check panicked while running.
    #[snafu(display("Check '{}' panicked.", check))]
    Panicked {
        /// Check name.
        check: String,
    },
}

/// A check.
#[async_trait]
pub trait Check: Send + Sync {
    /// Name of the check.
    fn name(&self) -> &str;

    /// Runs the check, submitting its output through `sender`.
    ///
    /// # Errors
    ///
    /// If the check cannot run or fails, an error is returned.
    async fn run(&self, sender: &Sender) -> Result<(), CheckError>;
}

/// Check collecting running pods.
///
/// Pod collection needs an orchestrator integration this build does not have, so running it always fails.
#[derive(Debug, Default)]
pub struct PodCheck;

#[async_trait]
impl Check for PodCheck {
    fn name(&self) -> &str {
        "pod"
    }

    async fn run(&self, _sender: &Sender) -> Result<(), CheckError> {
        Err(CheckError::NotImplemented {
            check: self.name().to_string(),
        })
    }
}

/// Runs `check` once, then commits whatever it submitted through `sender`.
///
/// Failures are logged and returned, and a panicking check is contained: it never takes down the caller. What the check
/// submitted before failing is still committed.
///
/// # Errors
///
/// If the check fails or panics, an error is returned.
pub async fn run_check(check: Arc<dyn Check>, sender: Sender) -> Result<(), CheckError> {
    let name = check.name().to_string();
    debug!(check = %name, sender = %sender.id(), "Running check.");

    let run_sender = sender.clone();
    let result = match spawn_traced(async move { check.run(&run_sender).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!(check = %name, error = %e, "Check panicked.");
            Err(CheckError::Panicked { check: name.clone() })
        }
    };

    if let Err(e) = &result {
        if !matches!(e, CheckError::Panicked { .. }) {
            error!(check = %name, error = %e, "Check failed.");
        }
    }

    sender.commit().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sampler::ShardMessage,
        sender::{tests::test_router, CheckId},
    };

    struct UptimeCheck;

    #[async_trait]
    impl Check for UptimeCheck {
        fn name(&self) -> &str {
            "uptime"
        }

        async fn run(&self, sender: &Sender) -> Result<(), CheckError> {
            sender.gauge("system.uptime", 3600.0, &[]);
            Ok(())
        }
    }

    struct PanickingCheck;

    #[async_trait]
    impl Check for PanickingCheck {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, sender: &Sender) -> Result<(), CheckError> {
            sender.gauge("flaky.before_panic", 1.0, &[]);
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn pod_check_is_not_implemented() {
        let (router, _shard_rx, _payloads_rx) = test_router();
        let sender = Sender::new(CheckId::new("pod"), "", router);

        let check = PodCheck;
        assert_eq!(check.name(), "pod");

        let result = run_check(Arc::new(check), sender).await;
        assert_eq!(
            result,
            Err(CheckError::NotImplemented {
                check: "pod".to_string()
            })
        );
    }

    #[tokio::test]
    async fn successful_run_is_committed() {
        let (router, mut shard_rx, mut payloads_rx) = test_router();
        let sender = Sender::new(CheckId::new("uptime"), "host-1", router);

        assert!(run_check(Arc::new(UptimeCheck), sender).await.is_ok());
        match shard_rx.try_recv() {
            Ok(ShardMessage::Samples(batch)) => assert_eq!(batch[0].name, "system.uptime"),
            _ => panic!("expected samples"),
        }
        assert!(payloads_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let (router, mut shard_rx, _payloads_rx) = test_router();
        let sender = Sender::new(CheckId::new("flaky"), "", router);

        let result = run_check(Arc::new(PanickingCheck), sender).await;
        assert_eq!(
            result,
            Err(CheckError::Panicked {
                check: "flaky".to_string()
            })
        );
        assert!(matches!(shard_rx.try_recv(), Ok(ShardMessage::Samples(_))));
    }
}
