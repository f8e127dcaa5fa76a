//! The ShaderToy JSON description format.
//!
//! A description is a list of render passes:
//!
//! ```json
//! {
//!   "renderpass": [
//!     {
//!       "name": "Buffer A",
//!       "type": "buffer",
//!       "code": "void mainImage(out vec4 c, in vec2 p) { ... }",
//!       "outputs": [{ "id": "4dXGR8", "channel": 0 }],
//!       "inputs": [
//!         { "channel": 0, "type": "buffer", "id": "4dXGR8",
//!           "sampler": { "filter": "linear", "wrap": "clamp" } }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Parsing is lenient. A pass or input that does not have the expected shape is
//! skipped with a warning so that the rest of the shader still loads. Documents
//! returned by the ShaderToy API wrap the description in `{"Shader": ...}`, and an
//! "export all" download holds many descriptions under `"shaders"`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// An output or input id. The format uses both strings and numbers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "Value")]
pub struct ResourceId(pub String);

impl From<Value> for ResourceId {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self(s),
            other => Self(other.to_string()),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassType {
    Common,
    Buffer,
    Cubemap,
    Image,
    /// Sound and any other pass type we do not run.
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Buffer,
    Cubemap,
    Texture,
    Volume,
    Keyboard,
    /// Video, music, webcam and other inputs we cannot provide.
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SamplerNames {
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub wrap: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct InputDesc {
    pub channel: usize,
    #[serde(rename = "type", alias = "ctype")]
    pub kind: InputType,
    #[serde(default)]
    pub id: Option<ResourceId>,
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
    pub sampler: SamplerNames,
}

impl InputDesc {
    /// File path of a texture input, `filepath` taking precedence over `src`.
    pub fn path(&self) -> Option<&str> {
        self.filepath.as_deref().or(self.src.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OutputDesc {
    pub id: ResourceId,
}

/// One render pass with its well-formed inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct PassDesc {
    pub name: String,
    pub kind: PassType,
    /// Source as stored, with `\n` possibly escaped.
    pub code: String,
    pub outputs: Vec<OutputDesc>,
    pub inputs: Vec<InputDesc>,
}

impl PassDesc {
    /// The id other passes use to reference this one: the last declared output.
    pub fn output_id(&self) -> Option<&ResourceId> {
        self.outputs.last().map(|o| &o.id)
    }
}

#[derive(Deserialize)]
struct RawPass {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: PassType,
    #[serde(default)]
    code: String,
    #[serde(default)]
    outputs: Vec<OutputDesc>,
    #[serde(default)]
    inputs: Vec<Value>,
}

#[derive(Deserialize)]
struct RawDescription {
    #[serde(default)]
    info: Option<Value>,
    renderpass: Vec<Value>,
}

/// A parsed shader description.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderDescription {
    /// `info.name` when present.
    pub name: Option<String>,
    pub passes: Vec<PassDesc>,
}

impl ShaderDescription {
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawDescription = serde_json::from_value(value)?;
        let name = raw
            .info
            .as_ref()
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut passes = Vec::with_capacity(raw.renderpass.len());
        for (i, value) in raw.renderpass.into_iter().enumerate() {
            let pass: RawPass = match serde_json::from_value(value) {
                Ok(pass) => pass,
                Err(e) => {
                    log::warn!("skipping malformed render pass #{i}: {e}");
                    continue;
                }
            };
            let mut inputs = Vec::with_capacity(pass.inputs.len());
            for value in pass.inputs {
                match serde_json::from_value::<InputDesc>(value) {
                    Ok(input) => inputs.push(input),
                    Err(e) => log::warn!("skipping malformed input of '{}': {e}", pass.name),
                }
            }
            passes.push(PassDesc {
                name: pass.name,
                kind: pass.kind,
                code: pass.code,
                outputs: pass.outputs,
                inputs,
            });
        }
        Ok(Self { name, passes })
    }
}

/// What a JSON file turned out to contain.
#[derive(Clone, Debug, PartialEq)]
pub enum Document {
    Shader(ShaderDescription),
    /// An "export all" download: `(id, description)` per shader.
    Export(Vec<(String, Value)>),
}

/// Parses a description, an API response or an export bundle.
pub fn parse_document(json: &str) -> Result<Document> {
    let mut value: Value = serde_json::from_str(json)?;

    if value.get("numShaders").is_some() {
        let shaders = match value.get_mut("shaders").map(Value::take) {
            Some(Value::Array(shaders)) => shaders,
            _ => Vec::new(),
        };
        let export = shaders
            .into_iter()
            .filter_map(|shader| {
                let id = shader.pointer("/info/id").cloned().map(ResourceId::from);
                match id {
                    Some(id) => Some((id.0, shader)),
                    None => {
                        log::warn!("skipping exported shader without info.id");
                        None
                    }
                }
            })
            .collect();
        return Ok(Document::Export(export));
    }

    if let Some(inner) = value.get_mut("Shader") {
        let inner = inner.take();
        return ShaderDescription::from_value(inner).map(Document::Shader);
    }
    ShaderDescription::from_value(value).map(Document::Shader)
}

/// Writes every exported shader to `dir/shader_<id>.json` and returns the paths.
pub fn write_export(shaders: &[(String, Value)], dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(shaders.len());
    for (id, shader) in shaders {
        let path = dir.join(format!("shader_{id}.json"));
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        shader.serialize(&mut ser)?;
        std::fs::write(&path, out).map_err(|e| Error::io(&path, e))?;
        log::info!("exported shader {id} to {}", path.display());
        written.push(path);
    }
    Ok(written)
}
