// Serialized identity of an app and of result handles bound to one

use super::registry::{default_app, thread_current_app};
use super::App;
use crate::task::AsyncResult;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// What survives serializing an app: its names and the changes layer.
///
/// Default layers, pending sources, pools and the task registry are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default)]
    pub changes: Map<String, Value>,
}

impl App {
    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            name: self.name().to_string(),
            main: self.main().map(str::to_string),
            changes: self.conf().changes(),
        }
    }

    /// Rebuild an app from a snapshot.
    ///
    /// The new app is not made current and does not read the environment.
    pub fn from_snapshot(snapshot: AppSnapshot) -> App {
        let mut builder = App::builder()
            .name(snapshot.name)
            .changes(snapshot.changes)
            .set_as_current(false)
            .read_env(false);
        if let Some(main) = snapshot.main {
            builder = builder.main(main);
        }
        builder.build()
    }
}

impl Serialize for App {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for App {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        AppSnapshot::deserialize(deserializer).map(App::from_snapshot)
    }
}

#[derive(Serialize, Deserialize)]
struct ResultRepr {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app: Option<AppSnapshot>,
}

// The app travels with the handle only when it was current at dump time;
// otherwise the handle restores onto the process default app.
impl Serialize for AsyncResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let app = thread_current_app()
            .filter(|current| current == self.app())
            .map(|current| current.snapshot());
        ResultRepr {
            id: self.id().to_string(),
            task_name: self.task_name().map(str::to_string),
            app,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AsyncResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ResultRepr::deserialize(deserializer)?;
        let app = repr.app.map(App::from_snapshot).unwrap_or_else(default_app);
        Ok(AsyncResult::new(repr.id, repr.task_name, app))
    }
}
