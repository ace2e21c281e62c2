use super::App;

/// A worker entry point driven by command-line arguments.
///
/// The app passes `argv` through unchanged and hands back whatever the
/// command returns.
pub trait WorkerCommand {
    type Output;

    fn execute_from_commandline(&self, app: &App, argv: &[String]) -> Self::Output;
}
