//! Token rewriting applied to shader source before compilation.
//!
//! ShaderToy code is written against WebGL GLSL. A handful of its identifiers either
//! clash with reserved names of the desktop GLSL dialect we compile with, or have to be
//! routed through our own combined image/sampler wrappers. [`rewrite`] renames them
//! with whole-word matching, so `sampler2D` is rewritten but `mySampler2Dx` is not.

/// Renames applied to every source, including our own prelude code.
const ALWAYS: &[(&str, &str)] = &[
    ("sampler2D", "CombinedImageSampler2D"),
    ("sampler3D", "CombinedImageSampler3D"),
    ("samplerCube", "CombinedImageSamplerCube"),
];

/// Renames applied only to user code.
const USER_ONLY: &[(&str, &str)] = &[
    ("textureCube", "ds_TextureCube"),
    ("packUnorm2x16", "ds_PackUnorm2x16"),
    ("packSnorm2x16", "ds_PackSnorm2x16"),
    ("packUnorm4x8", "ds_PackUnorm4x8"),
    ("packSnorm4x8", "ds_PackSnorm4x8"),
    ("unpackUnorm2x16", "ds_UnpackUnorm2x16"),
    ("unpackSnorm2x16", "ds_UnpackSnorm2x16"),
    ("unpackUnorm4x8", "ds_UnpackUnorm4x8"),
    ("unpackSnorm4x8", "ds_UnpackSnorm4x8"),
    ("buffer", "ds_Buffer"),
];

/// Rewrites `source` line by line. Every output line ends with `\n`.
///
/// `is_standard_code` marks code that ships with the viewer rather than code that came
/// from a shader description; only the sampler renames apply to it.
pub fn rewrite(source: &str, is_standard_code: bool) -> String {
    let mut out = String::with_capacity(source.len() + source.len() / 8);
    for line in source.lines() {
        let mut line = line.to_owned();
        for (from, to) in ALWAYS {
            line = replace_word(&line, from, to);
        }
        if !is_standard_code {
            for (from, to) in USER_ONLY {
                line = replace_word(&line, from, to);
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Turns literal two-character `\n` sequences into real newlines.
///
/// Shader descriptions exported from the web store code with escaped newlines.
pub fn unescape_newlines(source: &str) -> String {
    source.replace("\\n", "\n")
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Replaces every occurrence of `from` that is not glued to an identifier character
/// on either side.
fn replace_word(s: &str, from: &str, to: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (pos, _) in s.match_indices(from) {
        // Overlapping hits are impossible for these tokens, but a hit inside an
        // already consumed range must still be ignored.
        if pos < last {
            continue;
        }
        let end = pos + from.len();
        let bounded_before = pos == 0 || !is_ident_char(bytes[pos - 1]);
        let bounded_after = end == bytes.len() || !is_ident_char(bytes[end]);
        out.push_str(&s[last..pos]);
        if bounded_before && bounded_after {
            out.push_str(to);
        } else {
            out.push_str(from);
        }
        last = end;
    }
    out.push_str(&s[last..]);
    out
}
