//! Remote directory layout
//!
//! ```text
//! <base>/input/<track>.wav                     uploaded source
//! <base>/hidden/vocal/<track>_vocal.wav        separated vocal stem
//! <base>/hidden/inst/<track>_inst.wav          separated instrumental stem
//! <base>/output/<track>_vocal_output.wav       re-synthesized vocal
//! <base>/combined/<singer>_<track>.wav         final mix (completion marker)
//! <base>/train_input/<singer>/                 training audio for a new singer
//! ```

use serde::Serialize;

/// Make a user-supplied name safe to use as a single path component
///
/// Path separators, control characters and whitespace become `_`; leading
/// dots are stripped so the result is never hidden or a parent reference.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.trim_start_matches('.').to_string()
}

/// Every remote path one pipeline run touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePaths {
    pub input: String,
    pub separated_vocal: String,
    pub separated_instrumental: String,
    pub converted_vocal: String,
    pub combined: String,
}

#[derive(Debug, Clone)]
pub struct RemoteLayout {
    base_dir: String,
}

impl RemoteLayout {
    pub fn new(base_dir: impl Into<String>) -> Self {
        let base_dir: String = base_dir.into();
        Self {
            base_dir: base_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn input_dir(&self) -> String {
        format!("{}/input", self.base_dir)
    }

    pub fn input(&self, track: &str) -> String {
        format!("{}/{}.wav", self.input_dir(), track)
    }

    pub fn train_input_dir(&self, singer: &str) -> String {
        format!("{}/train_input/{}", self.base_dir, singer)
    }

    /// Paths for converting `track` with `singer`'s model
    ///
    /// Both names must already be sanitized.
    pub fn paths_for(&self, singer: &str, track: &str) -> RemotePaths {
        RemotePaths {
            input: self.input(track),
            separated_vocal: format!("{}/hidden/vocal/{}_vocal.wav", self.base_dir, track),
            separated_instrumental: format!("{}/hidden/inst/{}_inst.wav", self.base_dir, track),
            converted_vocal: format!("{}/output/{}_vocal_output.wav", self.base_dir, track),
            combined: format!("{}/combined/{}_{}.wav", self.base_dir, singer, track),
        }
    }
}
