//! In-process simulation of processing elements
//!
//! Scripted elements and TOML scenarios drive the engine without any real
//! media framework behind it; the `autoplug-sim` binary and the test suite
//! both build on this module.

mod elements;
mod scenario;

pub use elements::{
    OutputSpec, PortScript, ScriptedElement, ScriptedElementBuilder, ScriptedFactory,
    ScriptedFactoryBuilder,
};
pub use scenario::{FactorySpec, InputSpec, OutputDef, Scenario, ScriptDef, ScriptPortDef};
