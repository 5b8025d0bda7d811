//! TOML scenario files
//!
//! A scenario names the caps of the input and the factories available to
//! the autoplugger:
//!
//! ```toml
//! [input]
//! caps = "video/quicktime"
//! uri = "file:///media/clip.mov"
//!
//! [[factory]]
//! name = "qtdemux"
//! kind = "demuxer"
//! sink_caps = "video/quicktime"
//! outputs = [{ name = "src_%u", presence = "created-later", caps = "ANY" }]
//!
//! [factory.script]
//! ports = [
//!     { name = "src_0", caps = "video/x-h264" },
//!     { name = "src_1", caps = "audio/mpeg" },
//! ]
//!
//! [[factory]]
//! name = "avdec_h264"
//! kind = "decoder"
//! sink_caps = "video/x-h264"
//! outputs = [{ name = "src", caps = "video/x-raw" }]
//! ```

use super::elements::{PortScript, ScriptedElement, ScriptedFactory};
use crate::decodebin::Input;
use crate::element::{rank, ElementFactory, FactoryKind, Port, Presence};
use crate::error::{Error, Result};
use crate::registry::FactoryRegistry;
use autoplug_common::Caps;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Name of the factory behind scenario source elements
pub const SOURCE_FACTORY: &str = "scenariosrc";

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub input: InputSpec,
    #[serde(default, rename = "factory")]
    pub factories: Vec<FactorySpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    /// Caps of the source element's single output port
    pub caps: Caps,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_source_name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactorySpec {
    pub name: String,
    pub kind: FactoryKind,
    #[serde(default = "default_rank")]
    pub rank: u32,
    #[serde(default = "Caps::new_any")]
    pub sink_caps: Caps,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    #[serde(default)]
    pub script: Option<ScriptDef>,
    #[serde(default)]
    pub fail_create: bool,
    #[serde(default)]
    pub fail_link: bool,
    #[serde(default)]
    pub fail_state: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputDef {
    pub name: String,
    #[serde(default = "default_presence")]
    pub presence: Presence,
    pub caps: Caps,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptDef {
    #[serde(default)]
    pub ports: Vec<ScriptPortDef>,
    #[serde(default = "default_true")]
    pub no_more_ports: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPortDef {
    pub name: String,
    pub caps: Caps,
}

fn default_source_name() -> String {
    "source".to_string()
}

fn default_rank() -> u32 {
    rank::PRIMARY
}

fn default_presence() -> Presence {
    Presence::Always
}

fn default_true() -> bool {
    true
}

impl FactorySpec {
    pub fn build(&self) -> ScriptedFactory {
        let mut builder = ScriptedFactory::builder(&self.name, self.kind)
            .rank(self.rank)
            .sink_caps(self.sink_caps.clone())
            .fail_create(self.fail_create)
            .fail_link(self.fail_link)
            .fail_state(self.fail_state);
        for out in &self.outputs {
            builder = match out.presence {
                Presence::Always => builder.always_output(&out.name, out.caps.clone()),
                _ => builder.dynamic_output(&out.name, out.caps.clone()),
            };
        }
        if let Some(script) = &self.script {
            builder = builder.script(script.to_port_script());
        }
        builder.build()
    }
}

impl ScriptDef {
    pub fn to_port_script(&self) -> PortScript {
        PortScript {
            ports: self
                .ports
                .iter()
                .map(|p| Port::output(&p.name, Presence::CreatedLater, p.caps.clone()))
                .collect(),
            no_more_ports: self.no_more_ports,
        }
    }
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid scenario: {}", e)))?;
        if scenario.input.caps.is_any() {
            return Err(Error::Config("input caps must be fixed, not ANY".to_string()));
        }
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading scenario from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Instantiate every factory
    ///
    /// The scripted factories are returned alongside the registry so
    /// callers can reach the elements they create.
    pub fn build_registry(&self) -> (FactoryRegistry, Vec<Arc<ScriptedFactory>>) {
        let factories: Vec<Arc<ScriptedFactory>> =
            self.factories.iter().map(|f| Arc::new(f.build())).collect();
        let registry = FactoryRegistry::new(
            factories
                .iter()
                .map(|f| Arc::clone(f) as Arc<dyn ElementFactory>),
        );
        (registry, factories)
    }

    /// Source element producing the input caps on an always port `src`
    pub fn source(&self) -> Arc<ScriptedElement> {
        Arc::new(
            ScriptedElement::builder(&self.input.name)
                .factory(SOURCE_FACTORY)
                .always_output("src", self.input.caps.clone())
                .build(),
        )
    }

    pub fn input(&self) -> Input {
        let source = self.source();
        match &self.input.uri {
            Some(uri) => Input::from_uri(uri, source),
            None => Input::from_element(source),
        }
    }
}
