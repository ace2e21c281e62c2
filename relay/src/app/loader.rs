// Loader collaborator: task autodiscovery, admin mail and logging setup

use super::App;
use crate::imports;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, instrument};

/// Mail to the configured admins, with the `EMAIL_*` settings resolved
#[derive(Clone, Serialize)]
pub struct AdminMail {
    pub to: Vec<String>,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub host: String,
    pub port: u64,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub timeout: Option<f64>,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub fail_silently: bool,
}

impl fmt::Debug for AdminMail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminMail")
            .field("to", &self.to)
            .field("sender", &self.sender)
            .field("subject", &self.subject)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish_non_exhaustive()
    }
}

/// Environment-specific glue the app delegates to
#[cfg_attr(test, mockall::automock)]
pub trait Loader: Send + Sync {
    /// Import `<package>.<related_name>` for every package
    fn autodiscover_tasks(
        &self,
        app: &App,
        packages: &[String],
        related_name: &str,
    ) -> anyhow::Result<()>;

    /// Deliver `mail`; returns whether it was sent
    fn mail_admins(&self, mail: &AdminMail) -> anyhow::Result<bool>;

    fn ensure_process_aware_logger(&self) -> anyhow::Result<()> {
        crate::telemetry::init_process_aware_logging()
    }
}

/// Loader backed by the process module registry.
///
/// Admin mail is written to the log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoader;

impl Loader for DefaultLoader {
    #[instrument(skip(self, app), fields(app = %app.name()))]
    fn autodiscover_tasks(
        &self,
        app: &App,
        packages: &[String],
        related_name: &str,
    ) -> anyhow::Result<()> {
        for package in packages {
            let path = format!("{}.{}", package, related_name);
            match imports::import_task_module(&path) {
                Some(define) => {
                    define(app);
                    debug!(module = %path, "Imported task module");
                }
                None => debug!(module = %path, "No task module registered"),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, mail), fields(subject = %mail.subject))]
    fn mail_admins(&self, mail: &AdminMail) -> anyhow::Result<bool> {
        error!(
            to = ?mail.to,
            sender = %mail.sender,
            host = %mail.host,
            port = mail.port,
            body = %mail.body,
            "Mail to admins: {}",
            mail.subject
        );
        Ok(true)
    }
}
