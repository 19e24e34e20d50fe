pub mod scripted_runner;

pub use scripted_runner::{outcome, RecordedCall, Scripted, ScriptedRunner};
