//! Turns a [`ShaderDescription`] into a compiled [`PassSet`].
//!
//! Compilation runs in three phases:
//!
//! 1. Every buffer and cube map pass is given an index within its kind and its output
//!    id is recorded. Common passes are concatenated into the shared include.
//! 2. Each buffer, cube map and image pass resolves its inputs (pass references can
//!    point forward), loads the textures it needs and is compiled into a pipeline.
//! 3. Passes sampled with a mipmap filter by another pass are flagged so the frame
//!    graph generates their mip chain.
//!
//! A compile error aborts the load and destroys the pipelines created by it, leaving
//! whatever was loaded before untouched.

use std::collections::HashMap;

use crate::description::{InputDesc, InputType, PassDesc, PassType, ShaderDescription};
use crate::device::{
    CHANNEL_COUNT, ChannelLayout, PipelineDesc, PipelineId, RenderDevice, SampleKind,
    ViewDimension,
};
use crate::error::{Error, Result};
use crate::pass::{
    BUFFER_FORMAT, CUBE_FORMAT, FilterMode, Input, InputSource, Pass, PassKind, PassSet,
    SamplerSet, SamplerSpec, VIEWPORT_FORMAT,
};
use crate::preprocess;
use crate::texture::TextureCache;

/// First line of the shared include built from common passes.
const COMMON_HEADER: &str = "#pragma once\n";

/// Compiles shader descriptions against a device.
#[derive(Debug, Clone)]
pub struct PassGraphCompiler {
    cube_face_size: u32,
}

impl PassGraphCompiler {
    /// `cube_face_size` is the edge length cube map passes render at.
    pub fn new(cube_face_size: u32) -> Self {
        Self { cube_face_size }
    }

    /// Compiles `description`, loading its textures into `textures`.
    ///
    /// On error every pipeline created by this call has been destroyed again.
    /// Textures already loaded stay in `textures`.
    pub fn compile<D: RenderDevice>(
        &self,
        device: &mut D,
        textures: &mut TextureCache,
        samplers: &SamplerSet,
        description: &ShaderDescription,
    ) -> Result<PassSet> {
        let mut created = Vec::new();
        let result = self.compile_passes(device, textures, samplers, description, &mut created);
        if result.is_err() {
            for pipeline in created {
                device.destroy_pipeline(pipeline);
            }
        }
        result
    }

    fn compile_passes<D: RenderDevice>(
        &self,
        device: &mut D,
        textures: &mut TextureCache,
        samplers: &SamplerSet,
        description: &ShaderDescription,
        created: &mut Vec<PipelineId>,
    ) -> Result<PassSet> {
        // Phase 1: pass identities and common code.
        let mut refs = HashMap::new();
        let mut buffer_count = 0;
        let mut cube_count = 0;
        let mut common = String::from(COMMON_HEADER);
        let mut has_image = false;
        for pass in &description.passes {
            match pass.kind {
                PassType::Common => {
                    common.push_str(&preprocess::unescape_newlines(&pass.code));
                    common.push('\n');
                }
                PassType::Buffer => {
                    if let Some(id) = pass.output_id() {
                        refs.insert(id.0.clone(), InputSource::Buffer { index: buffer_count });
                    }
                    buffer_count += 1;
                }
                PassType::Cubemap => {
                    if let Some(id) = pass.output_id() {
                        refs.insert(id.0.clone(), InputSource::Cube { index: cube_count });
                    }
                    cube_count += 1;
                }
                PassType::Image => has_image = true,
                PassType::Unsupported => log::warn!("skipping unsupported pass '{}'", pass.name),
            }
        }
        if !has_image {
            return Err(Error::MissingImagePass);
        }
        let common_source = preprocess::rewrite(&common, false);

        // Phase 2: inputs and pipelines.
        let mut buffers = Vec::with_capacity(buffer_count);
        let mut cubemaps = Vec::with_capacity(cube_count);
        let mut image = None;
        for (index, desc) in description.passes.iter().enumerate() {
            let kind = match desc.kind {
                PassType::Buffer => PassKind::Buffer,
                PassType::Cubemap => PassKind::Cubemap,
                PassType::Image if image.is_some() => {
                    log::warn!("ignoring extra image pass '{}'", desc.name);
                    continue;
                }
                PassType::Image => PassKind::Image,
                PassType::Common | PassType::Unsupported => continue,
            };

            let name = if desc.name.is_empty() {
                format!("pass{index}")
            } else {
                desc.name.clone()
            };
            let mut inputs: Vec<Input> = Vec::new();
            let mut layouts = [ChannelLayout::default(); CHANNEL_COUNT];
            for input_desc in &desc.inputs {
                let Some((input, layout)) =
                    resolve_input(device, textures, samplers, &refs, &name, input_desc)?
                else {
                    continue;
                };
                inputs.retain(|existing| existing.channel != input.channel);
                layouts[input.channel] = layout;
                inputs.push(input);
            }

            let pipeline_desc = self.pipeline_desc(&name, index, kind, &common_source, desc, &layouts);
            let pipeline = match device.create_pipeline(&pipeline_desc) {
                Ok(pipeline) => pipeline,
                Err(message) => {
                    log::error!("failed to compile pass '{name}':\n{message}");
                    return Err(Error::ShaderCompile { pass: name, message });
                }
            };
            created.push(pipeline);
            log::debug!("compiled pass '{name}' ({kind:?}, {} inputs)", inputs.len());

            let mut pass = Pass::new(name, kind, pipeline);
            pass.inputs = inputs;
            match kind {
                PassKind::Buffer => buffers.push(pass),
                PassKind::Cubemap => cubemaps.push(pass),
                PassKind::Image => image = Some(pass),
            }
        }
        let image = image.ok_or(Error::MissingImagePass)?;

        let mut set = PassSet {
            buffers,
            cubemaps,
            image,
            common,
        };
        flag_mipmaps(&mut set);
        log::info!(
            "compiled {} buffer, {} cube map and 1 image pass",
            set.buffers.len(),
            set.cubemaps.len()
        );
        Ok(set)
    }

    fn pipeline_desc(
        &self,
        name: &str,
        index: usize,
        kind: PassKind,
        common_source: &str,
        desc: &PassDesc,
        layouts: &[ChannelLayout; CHANNEL_COUNT],
    ) -> PipelineDesc {
        let mut defines = Vec::new();
        let target_format = match kind {
            PassKind::Image => {
                defines.push(("MAIN_IMAGE".to_owned(), "1".to_owned()));
                VIEWPORT_FORMAT
            }
            PassKind::Cubemap => {
                defines.push(("CUBEMAP".to_owned(), "1".to_owned()));
                defines.push(("CUBE_FACE_SIZE".to_owned(), self.cube_face_size.to_string()));
                CUBE_FORMAT
            }
            PassKind::Buffer => BUFFER_FORMAT,
        };
        defines.push((format!("_TOYFRAME_USER_PASS{index}"), "1".to_owned()));

        let user = preprocess::rewrite(&preprocess::unescape_newlines(&desc.code), false);
        let mut source = String::with_capacity(common_source.len() + user.len() + 512);
        source.push_str(common_source);
        source.push_str(&channel_defines(layouts));
        source.push_str(&user);

        PipelineDesc {
            name: name.to_owned(),
            source,
            defines,
            target_format,
            channels: *layouts,
        }
    }
}

/// Resolves one input declaration. `Ok(None)` means the input is skipped.
fn resolve_input<D: RenderDevice>(
    device: &mut D,
    textures: &mut TextureCache,
    samplers: &SamplerSet,
    refs: &HashMap<String, InputSource>,
    pass: &str,
    input: &InputDesc,
) -> Result<Option<(Input, ChannelLayout)>> {
    if input.channel >= CHANNEL_COUNT {
        log::warn!("'{pass}': skipping input on channel {}", input.channel);
        return Ok(None);
    }
    let id = input.id.as_ref().map(|id| id.0.as_str());
    let pass_ref = id.and_then(|id| refs.get(id)).copied();

    let mut sample = SampleKind::Float;
    let source = match (input.kind, pass_ref) {
        (InputType::Buffer | InputType::Cubemap, Some(source)) => source,
        (InputType::Buffer, None) => {
            log::warn!("'{pass}': buffer input {:?} matches no pass", id);
            return Ok(None);
        }
        (InputType::Cubemap, None) => {
            let Some(path) = input.path() else {
                log::warn!("'{pass}': cube map input without a path");
                return Ok(None);
            };
            let (_, slot) = textures.load_cube_texture(device, path)?;
            InputSource::CubeTexture { slot }
        }
        (InputType::Texture, _) => {
            let Some(path) = input.path() else {
                log::warn!("'{pass}': texture input without a path");
                return Ok(None);
            };
            let (image, slot) = textures.load_texture(device, path)?;
            if let Some(desc) = device.image_desc(image) {
                sample = desc.format.sample_kind();
            }
            InputSource::Texture { slot }
        }
        (InputType::Volume, _) => {
            let Some(id) = id else {
                log::warn!("'{pass}': volume input without an id");
                return Ok(None);
            };
            let (_, slot) = textures.load_volume_texture(device, id)?;
            InputSource::VolumeTexture { slot }
        }
        (InputType::Keyboard, _) => InputSource::Keyboard,
        (InputType::Unsupported, _) => {
            log::warn!("'{pass}': unsupported input on channel {}", input.channel);
            return Ok(None);
        }
    };

    let requested = SamplerSpec::from_names(&input.sampler.filter, &input.sampler.wrap);
    let resolved = Input {
        channel: input.channel,
        source,
        sampler: samplers.bind(requested, source.is_static_texture()),
        requested,
    };
    let layout = ChannelLayout {
        dimension: source.view_dimension(),
        sample,
    };
    Ok(Some((resolved, layout)))
}

/// `#define iChannelN` for every channel slot, naming a handle to that slot.
pub(crate) fn channel_defines(layouts: &[ChannelLayout; CHANNEL_COUNT]) -> String {
    let mut block = String::new();
    for (channel, layout) in layouts.iter().enumerate() {
        let mut ty = match layout.dimension {
            ViewDimension::D2 => "CombinedImageSampler2D",
            ViewDimension::Cube => "CombinedImageSamplerCube",
            ViewDimension::D3 => "CombinedImageSampler3D",
        }
        .to_owned();
        if layout.sample == SampleKind::Uint {
            ty.push_str("_uint");
        }
        block.push_str(&format!("#define iChannel{channel} {ty}({channel})\n"));
    }
    block
}

/// Marks passes that some input samples with a mipmap filter.
fn flag_mipmaps(set: &mut PassSet) {
    let mut buffers = Vec::new();
    let mut cubes = Vec::new();
    for input in set.passes().flat_map(|pass| &pass.inputs) {
        if input.requested.filter != FilterMode::Mipmap {
            continue;
        }
        match input.source {
            InputSource::Buffer { index } => buffers.push(index),
            InputSource::Cube { index } => cubes.push(index),
            _ => {}
        }
    }
    for index in buffers {
        if let Some(pass) = set.buffers.get_mut(index) {
            pass.needs_mipmap = true;
        }
    }
    for index in cubes {
        if let Some(pass) = set.cubemaps.get_mut(index) {
            pass.needs_mipmap = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{Document, parse_document};
    use crate::testing::RecordingDevice;

    struct Fixture {
        device: RecordingDevice,
        textures: TextureCache,
        samplers: SamplerSet,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("data.bin"), [1u8; 20]).unwrap();
            let mut device = RecordingDevice::new();
            let samplers = SamplerSet::new(&mut device);
            Self {
                textures: TextureCache::new(dir.path(), Vec::new()),
                device,
                samplers,
                _dir: dir,
            }
        }

        fn compile(&mut self, json: &str) -> Result<PassSet> {
            let Document::Shader(desc) = parse_document(json).unwrap() else {
                panic!("expected a shader");
            };
            PassGraphCompiler::new(1024).compile(
                &mut self.device,
                &mut self.textures,
                &self.samplers,
                &desc,
            )
        }

        fn source(&self, pass: &Pass) -> String {
            self.device.pipeline(pass.pipeline).unwrap().source.clone()
        }
    }

    const SAMPLER: &str = r#""sampler": { "filter": "linear", "wrap": "clamp" }"#;

    #[test]
    fn forward_buffer_reference() {
        let json = format!(
            r#"{{ "renderpass": [
                {{ "name": "Image", "type": "image", "code": "",
                   "inputs": [ {{ "channel": 0, "type": "buffer", "id": "B", {SAMPLER} }} ] }},
                {{ "name": "Buffer A", "type": "buffer", "code": "", "outputs": [ {{ "id": "A" }} ] }},
                {{ "name": "Buffer B", "type": "buffer", "code": "", "outputs": [ {{ "id": "B" }} ],
                   "inputs": [ {{ "channel": 2, "type": "buffer", "id": "A", {SAMPLER} }} ] }}
            ] }}"#
        );
        let mut fx = Fixture::new();
        let set = fx.compile(&json).unwrap();
        assert_eq!(set.buffers.len(), 2);
        assert_eq!(set.buffers[1].name, "Buffer B");
        assert_eq!(set.image.inputs[0].source, InputSource::Buffer { index: 1 });
        assert_eq!(set.buffers[1].inputs[0].source, InputSource::Buffer { index: 0 });
        assert_eq!(fx.device.live_pipelines(), 3);
    }

    #[test]
    fn missing_image_pass() {
        let mut fx = Fixture::new();
        let err = fx
            .compile(r#"{ "renderpass": [ { "type": "buffer", "code": "" } ] }"#)
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingImagePass));
        assert_eq!(fx.device.live_pipelines(), 0);
    }

    #[test]
    fn compile_failure_destroys_created_pipelines() {
        let json = r#"{ "renderpass": [
            { "name": "Buffer A", "type": "buffer", "code": "ok", "outputs": [ { "id": "A" } ] },
            { "name": "Image", "type": "image", "code": "BROKEN" }
        ] }"#;
        let mut fx = Fixture::new();
        fx.device.fail_marker = Some("BROKEN".into());
        match fx.compile(json) {
            Err(Error::ShaderCompile { pass, message }) => {
                assert_eq!(pass, "Image");
                assert!(message.contains("BROKEN"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("compile should fail"),
        }
        assert_eq!(fx.device.live_pipelines(), 0);
    }

    #[test]
    fn mipmap_requests() {
        let json = r#"{ "renderpass": [
            { "name": "Buffer A", "type": "buffer", "code": "", "outputs": [ { "id": "A" } ] },
            { "name": "Buffer B", "type": "buffer", "code": "", "outputs": [ { "id": "B" } ] },
            { "name": "Image", "type": "image", "code": "", "inputs": [
                { "channel": 0, "type": "buffer", "id": "A",
                  "sampler": { "filter": "mipmap", "wrap": "repeat" } },
                { "channel": 1, "type": "buffer", "id": "B",
                  "sampler": { "filter": "linear", "wrap": "repeat" } },
                { "channel": 2, "type": "volume", "id": "abc",
                  "sampler": { "filter": "mipmap", "wrap": "repeat" } }
            ] }
        ] }"#;
        let mut fx = Fixture::new();
        let set = fx.compile(json).unwrap();
        assert!(set.buffers[0].needs_mipmap);
        assert!(!set.buffers[1].needs_mipmap);

        let mip = SamplerSpec::from_names("mipmap", "repeat");
        let linear = SamplerSpec::from_names("linear", "repeat");
        assert_eq!(set.image.inputs[0].sampler, fx.samplers.get(mip));
        // Static textures bind the linear sampler but remember the request.
        assert_eq!(set.image.inputs[2].sampler, fx.samplers.get(linear));
        assert_eq!(set.image.inputs[2].requested, mip);
    }

    #[test]
    fn channel_macros_and_preprocessing() {
        let json = r#"{ "renderpass": [
            { "type": "common", "code": "float buffer = 1.0;\\nvec4 f(sampler2D s);" },
            { "name": "Image", "type": "image", "code": "void mainImage() { textureCube(iChannel1, d); }",
              "inputs": [
                { "channel": 1, "type": "cubemap", "id": "sky", "filepath": "sky.png",
                  "sampler": { "filter": "linear", "wrap": "clamp" } },
                { "channel": 3, "type": "volume", "id": "4sfGRr",
                  "sampler": { "filter": "linear", "wrap": "clamp" } },
                { "channel": 2, "type": "texture", "filepath": "data.bin",
                  "sampler": { "filter": "nearest", "wrap": "clamp" } }
              ] }
        ] }"#;
        let mut fx = Fixture::new();
        let set = fx.compile(json).unwrap();
        assert_eq!(set.image.inputs[0].source, InputSource::CubeTexture { slot: 0 });
        assert_eq!(fx.textures.len(), 3);

        let source = fx.source(&set.image);
        assert!(source.starts_with("#pragma once\nfloat ds_Buffer = 1.0;\nvec4 f(CombinedImageSampler2D s);\n"));
        assert!(source.contains("#define iChannel0 CombinedImageSampler2D(0)\n"));
        assert!(source.contains("#define iChannel1 CombinedImageSamplerCube(1)\n"));
        assert!(source.contains("#define iChannel2 CombinedImageSampler2D_uint(2)\n"));
        assert!(source.contains("#define iChannel3 CombinedImageSampler3D(3)\n"));
        assert!(source.ends_with("void mainImage() { ds_TextureCube(iChannel1, d); }\n"));

        let desc = fx.device.pipeline(set.image.pipeline).unwrap();
        assert_eq!(desc.channels[1].dimension, ViewDimension::Cube);
        assert_eq!(desc.channels[2].sample, SampleKind::Uint);
        assert!(desc.defines.contains(&("MAIN_IMAGE".to_owned(), "1".to_owned())));
        assert_eq!(desc.target_format, VIEWPORT_FORMAT);
    }

    #[test]
    fn common_passes_kept_on_separate_lines() {
        let json = r##"{ "renderpass": [
            { "type": "common", "code": "#define A 1" },
            { "type": "common", "code": "#define B 2" },
            { "name": "Image", "type": "image", "code": "" }
        ] }"##;
        let mut fx = Fixture::new();
        let set = fx.compile(json).unwrap();
        let source = fx.source(&set.image);
        assert!(source.starts_with("#pragma once\n#define A 1\n#define B 2\n"));
    }

    #[test]
    fn cubemap_pass_defines() {
        let json = r#"{ "renderpass": [
            { "name": "Cube A", "type": "cubemap", "code": "", "outputs": [ { "id": "C" } ] },
            { "name": "Image", "type": "image", "code": "", "inputs": [
                { "channel": 0, "type": "cubemap", "id": "C",
                  "sampler": { "filter": "linear", "wrap": "clamp" } } ] }
        ] }"#;
        let mut fx = Fixture::new();
        let set = fx.compile(json).unwrap();
        assert_eq!(set.image.inputs[0].source, InputSource::Cube { index: 0 });
        assert_eq!(fx.textures.len(), 0);
        let desc = fx.device.pipeline(set.cubemaps[0].pipeline).unwrap();
        assert!(desc.defines.contains(&("CUBE_FACE_SIZE".to_owned(), "1024".to_owned())));
        assert_eq!(desc.target_format, CUBE_FORMAT);
    }

    #[test]
    fn invalid_inputs_skipped_and_duplicates_replaced() {
        let json = r#"{ "renderpass": [
            { "name": "Image", "type": "image", "code": "", "inputs": [
                { "channel": 4, "type": "keyboard", "sampler": {} },
                { "channel": 0, "type": "buffer", "id": "nowhere", "sampler": {} },
                { "channel": 0, "type": "texture", "sampler": {} },
                { "channel": 1, "type": "volume", "id": "abc", "sampler": {} },
                { "channel": 1, "type": "keyboard", "sampler": {} }
            ] },
            { "name": "Second", "type": "image", "code": "" }
        ] }"#;
        let mut fx = Fixture::new();
        let set = fx.compile(json).unwrap();
        assert_eq!(set.image.name, "Image");
        assert_eq!(set.image.inputs.len(), 1);
        assert_eq!(set.image.input(1).unwrap().source, InputSource::Keyboard);
        // The replaced volume stays cached, the extra image pass is never compiled.
        assert_eq!(fx.textures.len(), 1);
        assert_eq!(fx.device.live_pipelines(), 1);
    }
}
