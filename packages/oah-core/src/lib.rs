//! oah-core: settings, the template library, matching, the routines and the
//! per-device workers.

pub mod config;
pub mod engine;
pub mod resource;
pub mod store;
pub mod task;
pub mod vision;
pub mod worker;

pub use config::{Module, Settings, StopPolicy};
pub use engine::{Command, DeviceSlot, Engine, EngineOptions};
pub use resource::TemplateLibrary;
pub use task::{DeviceEvt, Flag, StopCondition};
pub use worker::{RunReport, WorkerState, WorkerStatus};
