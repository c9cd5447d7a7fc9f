//! Shader program management.
//!
//! WGSL has no preprocessor, so the manager provides the two pieces the
//! demo needs on top of it:
//! - `#include "name"` lines, resolved against registered includes
//! - definition text prepended to a stage (e.g. `const USE_VIEWPORT: bool = true;`)
//!
//! Sources are looked up in an explicit, ordered list of directories and are
//! read again on every reload, so editing a shader and pressing
//! "Reload Shader" picks up the change.
//!
//! # Example
//!
//! ```ignore
//! let mut manager = ShaderProgramManager::new(vec!["shaders".into()]);
//! manager.register_include("common.wgsl", "common.wgsl");
//! let id = manager.create_program(&[
//!     ProgramDefinition::new(ShaderStage::Vertex, "scene.vert.wgsl"),
//!     ProgramDefinition::new(ShaderStage::Fragment, "scene.frag.wgsl"),
//! ]);
//! manager.reload_programs(backend);
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::{
    BackendError, CompareFunction, CullMode, FrontFace, GraphicsBackend, ProgramDescriptor,
    ProgramHandle, ShaderModuleSource, ShaderStage,
};

/// Errors raised while assembling or compiling a program
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Include not found: \"{0}\"")]
    IncludeNotFound(String),
    #[error("Shader source '{0}' not found in any search directory")]
    SourceNotFound(String),
    #[error("Program has no {0:?} stage")]
    MissingStage(ShaderStage),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One stage of a program: a source file plus text prepended to it
#[derive(Debug, Clone)]
pub struct ProgramDefinition {
    pub stage: ShaderStage,
    pub filename: String,
    pub definitions: String,
    pub entry_point: String,
}

impl ProgramDefinition {
    pub fn new(stage: ShaderStage, filename: &str) -> Self {
        let entry_point = match stage {
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Fragment => "fs_main",
        };
        Self {
            stage,
            filename: filename.to_string(),
            definitions: String::new(),
            entry_point: entry_point.to_string(),
        }
    }

    /// Prepend `definitions` to the stage source
    pub fn with_definitions(mut self, definitions: &str) -> Self {
        self.definitions = definitions.to_string();
        self
    }
}

/// Fixed-function and binding state shared by the programs of a manager
#[derive(Debug, Clone)]
pub struct ProgramLayout {
    pub uniform_bindings: Vec<u32>,
    pub rate_image_binding: Option<u32>,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_compare: CompareFunction,
}

impl Default for ProgramLayout {
    fn default() -> Self {
        Self {
            uniform_bindings: vec![0, 1],
            rate_image_binding: None,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_compare: CompareFunction::Less,
        }
    }
}

/// Index of a program inside its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(usize);

#[derive(Debug)]
struct ProgramEntry {
    definitions: Vec<ProgramDefinition>,
    handle: Option<ProgramHandle>,
}

/// Loads, compiles and reloads the shader programs of the demo
#[derive(Debug)]
pub struct ShaderProgramManager {
    directories: Vec<PathBuf>,
    /// Include name -> file name
    includes: HashMap<String, String>,
    layout: ProgramLayout,
    programs: Vec<ProgramEntry>,
    valid: bool,
}

impl ShaderProgramManager {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self {
            directories,
            includes: HashMap::new(),
            layout: ProgramLayout::default(),
            programs: Vec::new(),
            valid: false,
        }
    }

    /// Append a search directory
    pub fn add_directory(&mut self, directory: impl Into<PathBuf>) {
        self.directories.push(directory.into());
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Make `#include "name"` expand to the contents of `filename`
    pub fn register_include(&mut self, name: &str, filename: &str) {
        self.includes.insert(name.to_string(), filename.to_string());
    }

    /// Binding and raster state used for every program created afterwards
    pub fn set_layout(&mut self, layout: ProgramLayout) {
        self.layout = layout;
    }

    /// Register a program. It is compiled by the next [`reload_programs`](Self::reload_programs).
    pub fn create_program(&mut self, definitions: &[ProgramDefinition]) -> ProgramId {
        self.programs.push(ProgramEntry {
            definitions: definitions.to_vec(),
            handle: None,
        });
        self.valid = false;
        ProgramId(self.programs.len() - 1)
    }

    /// Compiled program for `id`, if any compile ever succeeded
    pub fn get(&self, id: ProgramId) -> Option<ProgramHandle> {
        self.programs.get(id.0).and_then(|entry| entry.handle)
    }

    /// Whether the last reload compiled every program
    pub fn are_programs_valid(&self) -> bool {
        self.valid
    }

    /// Recompile every program from disk.
    ///
    /// A program that fails keeps its previous handle. Returns whether all
    /// programs compiled.
    pub fn reload_programs(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        let mut valid = true;

        for index in 0..self.programs.len() {
            match self.compile(&self.programs[index].definitions, backend) {
                Ok(handle) => {
                    let entry = &mut self.programs[index];
                    if let Some(old) = entry.handle.replace(handle) {
                        backend.destroy_program(old);
                    }
                    log::debug!("Compiled program {}", index);
                }
                Err(e) => {
                    log::error!("Failed to compile program {}: {}", index, e);
                    valid = false;
                }
            }
        }

        self.valid = valid;
        valid
    }

    /// Destroy every compiled program
    pub fn delete_programs(&mut self, backend: &mut dyn GraphicsBackend) {
        for entry in &mut self.programs {
            if let Some(handle) = entry.handle.take() {
                backend.destroy_program(handle);
            }
        }
        self.valid = false;
    }

    /// Full WGSL text of one stage: definitions, then the file with includes expanded
    pub fn compose_source(&self, definition: &ProgramDefinition) -> Result<String, ShaderError> {
        let source = self.load_source(&definition.filename)?;
        let mut included = HashSet::new();
        let resolved = self.resolve_includes(&source, &mut included)?;

        let mut composed = String::with_capacity(definition.definitions.len() + resolved.len() + 1);
        if !definition.definitions.is_empty() {
            composed.push_str(&definition.definitions);
            composed.push('\n');
        }
        composed.push_str(&resolved);
        Ok(composed)
    }

    fn compile(
        &self,
        definitions: &[ProgramDefinition],
        backend: &mut dyn GraphicsBackend,
    ) -> Result<ProgramHandle, ShaderError> {
        let stage = |stage: ShaderStage| -> Result<ShaderModuleSource, ShaderError> {
            let definition = definitions
                .iter()
                .find(|d| d.stage == stage)
                .ok_or(ShaderError::MissingStage(stage))?;
            Ok(ShaderModuleSource {
                stage,
                source: self.compose_source(definition)?,
                entry_point: definition.entry_point.clone(),
            })
        };

        let vertex = stage(ShaderStage::Vertex)?;
        let fragment = stage(ShaderStage::Fragment)?;
        let label = format!(
            "{} + {}",
            definitions_name(definitions, ShaderStage::Vertex),
            definitions_name(definitions, ShaderStage::Fragment)
        );

        let handle = backend.create_program(&ProgramDescriptor {
            label: Some(label),
            vertex,
            fragment,
            uniform_bindings: self.layout.uniform_bindings.clone(),
            rate_image_binding: self.layout.rate_image_binding,
            front_face: self.layout.front_face,
            cull_mode: self.layout.cull_mode,
            depth_compare: self.layout.depth_compare,
        })?;
        Ok(handle)
    }

    fn load_source(&self, filename: &str) -> Result<String, ShaderError> {
        let path = self
            .find_file(filename)
            .ok_or_else(|| ShaderError::SourceNotFound(filename.to_string()))?;
        std::fs::read_to_string(&path).map_err(|source| ShaderError::Io { path, source })
    }

    fn find_file(&self, filename: &str) -> Option<PathBuf> {
        self.directories
            .iter()
            .map(|dir| dir.join(filename))
            .find(|path| path.is_file())
            .or_else(|| {
                let path = Path::new(filename);
                (path.is_absolute() && path.is_file()).then(|| path.to_path_buf())
            })
    }

    /// Resolve `#include "name"` lines recursively, each include at most once
    fn resolve_includes(
        &self,
        source: &str,
        included: &mut HashSet<String>,
    ) -> Result<String, ShaderError> {
        let mut result = String::with_capacity(source.len());

        for line in source.lines() {
            if let Some(name) = parse_include_directive(line.trim()) {
                if !included.insert(name.to_string()) {
                    continue;
                }
                let filename = self
                    .includes
                    .get(name)
                    .ok_or_else(|| ShaderError::IncludeNotFound(name.to_string()))?;
                let include_source = self.load_source(filename)?;
                result.push_str(&self.resolve_includes(&include_source, included)?);
            } else {
                result.push_str(line);
            }
            result.push('\n');
        }

        Ok(result)
    }
}

fn definitions_name(definitions: &[ProgramDefinition], stage: ShaderStage) -> &str {
    definitions
        .iter()
        .find(|d| d.stage == stage)
        .map(|d| d.filename.as_str())
        .unwrap_or("?")
}

/// Parse a `#include "path"` directive, returning the path if found.
fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("#include")?.trim();
    if let Some(inner) = rest.strip_prefix('"') {
        inner.strip_suffix('"')
    } else if let Some(inner) = rest.strip_prefix('<') {
        inner.strip_suffix('>')
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, RecordingBackend};

    /// Scratch directory unique to one test
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("vrs-demo-shader-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, filename: &str, contents: &str) {
        std::fs::write(dir.join(filename), contents).unwrap();
    }

    fn shipped_manager() -> ShaderProgramManager {
        let shaders = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders");
        let mut manager = ShaderProgramManager::new(vec![shaders]);
        manager.register_include("common.wgsl", "common.wgsl");
        manager.register_include("noise.wgsl", "noise.wgsl");
        manager
    }

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("WGSL parse error: {}", e.emit_to_string(source)));
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .unwrap_or_else(|e| panic!("Validation error: {:?}", e));
    }

    #[test]
    fn test_parse_include_directive() {
        assert_eq!(parse_include_directive("#include \"common.wgsl\""), Some("common.wgsl"));
        assert_eq!(parse_include_directive("#include <noise.wgsl>"), Some("noise.wgsl"));
        assert_eq!(parse_include_directive("#include common.wgsl"), None);
        assert_eq!(parse_include_directive("// #include \"x\""), None);
    }

    #[test]
    fn test_include_resolution() {
        let dir = scratch_dir("include");
        write(&dir, "shared.wgsl", "const SHARED: f32 = 1.0;");
        write(
            &dir,
            "main.wgsl",
            "#include \"shared\"\n#include \"shared\"\nfn f() -> f32 { return SHARED; }",
        );

        let mut manager = ShaderProgramManager::new(vec![dir.clone()]);
        manager.register_include("shared", "shared.wgsl");
        let definition = ProgramDefinition::new(ShaderStage::Vertex, "main.wgsl")
            .with_definitions("const A: i32 = 1;");
        let composed = manager.compose_source(&definition).unwrap();

        assert!(composed.starts_with("const A: i32 = 1;\n"));
        assert_eq!(composed.matches("const SHARED").count(), 1);
        assert!(composed.contains("fn f()"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_include() {
        let dir = scratch_dir("missing-include");
        write(&dir, "main.wgsl", "#include \"nowhere\"\n");
        let manager = ShaderProgramManager::new(vec![dir.clone()]);

        let result =
            manager.compose_source(&ProgramDefinition::new(ShaderStage::Vertex, "main.wgsl"));
        assert!(matches!(result, Err(ShaderError::IncludeNotFound(name)) if name == "nowhere"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_directories_are_searched_in_order() {
        let first = scratch_dir("order-first");
        let second = scratch_dir("order-second");
        write(&second, "a.wgsl", "// second");
        let mut manager = ShaderProgramManager::new(vec![first.clone()]);

        let definition = ProgramDefinition::new(ShaderStage::Vertex, "a.wgsl");
        assert!(matches!(
            manager.compose_source(&definition),
            Err(ShaderError::SourceNotFound(_))
        ));

        manager.add_directory(&second);
        assert!(manager.compose_source(&definition).unwrap().contains("second"));

        write(&first, "a.wgsl", "// first");
        assert!(manager.compose_source(&definition).unwrap().contains("first"));
        let _ = std::fs::remove_dir_all(first);
        let _ = std::fs::remove_dir_all(second);
    }

    #[test]
    fn test_failed_reload_keeps_previous_program() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut manager = shipped_manager();
        let id = manager.create_program(&[
            ProgramDefinition::new(ShaderStage::Vertex, "scene.vert.wgsl"),
            ProgramDefinition::new(ShaderStage::Fragment, "scene.frag.wgsl"),
        ]);

        assert!(manager.reload_programs(&mut backend));
        let first = manager.get(id).unwrap();

        backend.set_program_creation_fails(true);
        assert!(!manager.reload_programs(&mut backend));
        assert!(!manager.are_programs_valid());
        assert_eq!(manager.get(id), Some(first));

        backend.set_program_creation_fails(false);
        assert!(manager.reload_programs(&mut backend));
        assert_ne!(manager.get(id), Some(first));
        assert_eq!(backend.count(|c| *c == Command::DestroyProgram(first)), 1);
        assert_eq!(backend.live_program_count(), 1);
    }

    #[test]
    fn test_missing_stage_is_invalid() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut manager = shipped_manager();
        let id = manager.create_program(&[ProgramDefinition::new(
            ShaderStage::Vertex,
            "scene.vert.wgsl",
        )]);
        assert!(!manager.reload_programs(&mut backend));
        assert_eq!(manager.get(id), None);
    }

    #[test]
    fn test_shipped_shaders_validate() {
        let manager = shipped_manager();
        let vertex = manager
            .compose_source(
                &ProgramDefinition::new(ShaderStage::Vertex, "scene.vert.wgsl")
                    .with_definitions("const USE_VIEWPORT: bool = true;"),
            )
            .unwrap();
        let fragment = manager
            .compose_source(&ProgramDefinition::new(ShaderStage::Fragment, "scene.frag.wgsl"))
            .unwrap();
        validate(&vertex);
        validate(&fragment);
    }
}
