// Error mail sent to admins when a task fails

use crate::task::Task;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

pub const DEFAULT_SUBJECT: &str = "[{hostname}] Error: Task {name} ({id}): {exc}";

pub const DEFAULT_BODY: &str = "Task {name} with id {id} raised exception:\n{exc}\n\n\n\
Task was called with args: {args} kwargs: {kwargs}.\n\n\
The contents of the full traceback was:\n\n{traceback}\n\n\
-- \nJust to let you know,\nrelay at {hostname}.\n";

/// Details of a failed task invocation
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub name: String,
    pub id: String,
    pub exc: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub traceback: String,
    pub hostname: String,
}

impl ErrorContext {
    pub fn new(name: impl Into<String>, id: impl Into<String>, exc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            exc: exc.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            traceback: String::new(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    fn field(&self, placeholder: &str) -> Option<String> {
        let value = match placeholder {
            "name" => self.name.clone(),
            "id" => self.id.clone(),
            "exc" => self.exc.clone(),
            "args" => Value::from(self.args.clone()).to_string(),
            "kwargs" => Value::Object(self.kwargs.clone()).to_string(),
            "traceback" => self.traceback.clone(),
            "hostname" => self.hostname.clone(),
            _ => return None,
        };
        Some(value)
    }
}

type ShouldSend = Arc<dyn Fn(&ErrorContext) -> bool + Send + Sync>;

/// Formats and sends task error mail through the task's app
#[derive(Clone)]
pub struct ErrorMail {
    task: Task,
    subject: String,
    body: String,
    should_send: ShouldSend,
}

impl ErrorMail {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            subject: DEFAULT_SUBJECT.to_string(),
            body: DEFAULT_BODY.to_string(),
            should_send: Arc::new(|_: &ErrorContext| true),
        }
    }

    pub fn with_subject(mut self, template: impl Into<String>) -> Self {
        self.subject = template.into();
        self
    }

    pub fn with_body(mut self, template: impl Into<String>) -> Self {
        self.body = template.into();
        self
    }

    /// Decide per failure whether mail goes out
    pub fn with_should_send<F>(mut self, should_send: F) -> Self
    where
        F: Fn(&ErrorContext) -> bool + Send + Sync + 'static,
    {
        self.should_send = Arc::new(should_send);
        self
    }

    pub fn should_send(&self, context: &ErrorContext) -> bool {
        (self.should_send)(context)
    }

    pub fn format_subject(&self, context: &ErrorContext) -> String {
        render(&self.subject, context)
    }

    pub fn format_body(&self, context: &ErrorContext) -> String {
        render(&self.body, context)
    }

    /// Mail the admins of the task's app. Returns whether mail was sent.
    pub fn send(&self, context: &ErrorContext, fail_silently: bool) -> anyhow::Result<bool> {
        if !self.should_send(context) {
            debug!(task = %context.name, task_id = %context.id, "Error mail suppressed");
            return Ok(false);
        }
        self.task.app().mail_admins(
            &self.format_subject(context),
            &self.format_body(context),
            fail_silently,
        )
    }
}

impl fmt::Debug for ErrorMail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMail")
            .field("task", &self.task)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("Invalid regex pattern"))
}

// Unknown placeholders are left as written.
fn render(template: &str, context: &ErrorContext) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            context
                .field(&caps[1])
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::loader::MockLoader;
    use crate::app::App;
    use crate::task::TaskOptions;
    use serde_json::json;

    fn app_with_loader(loader: MockLoader) -> App {
        App::builder()
            .main("mail_tests")
            .loader(Arc::new(loader))
            .setting("ADMINS", json!(["admin@example.com"]))
            .set_as_current(false)
            .read_env(false)
            .build()
    }

    fn failing_task(app: &App) -> Task {
        app.task_with("fails", TaskOptions::default().shared(false), |_| {
            anyhow::bail!("FOOBARBAZ")
        })
    }

    fn context() -> ErrorContext {
        let mut context = ErrorContext::new("mail_tests.fails", "abc-123", "FOOBARBAZ");
        context.hostname = "lana".to_string();
        context.args = vec![json!(1)];
        context
    }

    #[test]
    fn test_subject_template() {
        let app = app_with_loader(MockLoader::new());
        let mail = ErrorMail::new(failing_task(&app));
        assert_eq!(
            mail.format_subject(&context()),
            "[lana] Error: Task mail_tests.fails (abc-123): FOOBARBAZ"
        );
        let body = mail.format_body(&context());
        assert!(body.contains("args: [1] kwargs: {}"));
        assert!(body.ends_with("relay at lana.\n"));
    }

    #[test]
    fn test_unknown_placeholders_are_kept() {
        let app = app_with_loader(MockLoader::new());
        let mail = ErrorMail::new(failing_task(&app)).with_subject("{name} {unknown}");
        assert_eq!(mail.format_subject(&context()), "mail_tests.fails {unknown}");
    }

    #[test]
    fn test_send_mails_admins() {
        let mut loader = MockLoader::new();
        loader
            .expect_mail_admins()
            .withf(|mail| mail.subject.contains("FOOBARBAZ") && mail.fail_silently)
            .times(1)
            .returning(|_| Ok(true));
        let app = app_with_loader(loader);

        let mail = ErrorMail::new(failing_task(&app));
        assert!(mail.send(&context(), true).unwrap());
    }

    #[test]
    fn test_disabled_mail_never_reaches_loader() {
        let mut loader = MockLoader::new();
        loader.expect_mail_admins().times(0);
        let app = app_with_loader(loader);

        let mail = ErrorMail::new(failing_task(&app)).with_should_send(|_| false);
        assert!(!mail.send(&context(), true).unwrap());
    }
}
