//! Packs project resource targets into deployable form.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};

use kiln_resource::{
    intern_binary_header, peek_binary_header, peek_readable_type, BuildLock, PackBuilder,
    ResourceProject, TypeHeader, STRING_REGISTRY_FILE,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum LogChoice {
    Debug,
    Regular,
    Quiet,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum PackMode {
    /// Copy resource files into the workspace as-is.
    None,
    /// Produce one read-only pack per target.
    Regular,
    /// Produce packs with string-registry-encoded type headers.
    Interned,
}

#[derive(Parser, Debug)]
#[command(name = "resource_build", about = "Builds resource targets of a Kiln project")]
struct Arguments {
    /// Path to the resource project file.
    #[arg(long)]
    project: PathBuf,

    #[arg(long, value_enum, default_value = "regular")]
    log: LogChoice,

    #[arg(long, value_enum, default_value = "none")]
    pack: PackMode,

    /// Targets to build; each must be a plugin of the project.
    #[arg(long, num_args = 1.., required = true)]
    targets: Vec<String>,
}

const EXIT_INVALID_ARGUMENTS: u8 = 255; // -1 as a process exit byte
const EXIT_SETUP_FAILED: u8 = 254; // -2
const EXIT_BUILD_FAILED: u8 = 253; // -3

fn main() -> ExitCode {
    let arguments = match Arguments::try_parse() {
        Ok(arguments) => arguments,
        Err(error) => {
            eprintln!("{}", error);
            return ExitCode::from(EXIT_INVALID_ARGUMENTS);
        }
    };

    let filter = match arguments.log {
        LogChoice::Debug => log::LevelFilter::Debug,
        LogChoice::Regular => log::LevelFilter::Info,
        LogChoice::Quiet => log::LevelFilter::Error,
    };
    env_logger::Builder::new().filter_level(filter).init();

    let (project, project_directory) = match setup(&arguments) {
        Ok(setup) => setup,
        Err(error) => {
            log::error!(target: "resource_build", "setup failed: {:#}", error);
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    let workspace = project_directory.join(&project.workspace_directory);
    let _lock = match BuildLock::acquire(&workspace) {
        Ok(lock) => lock,
        Err(error) => {
            log::error!(target: "resource_build", "setup failed: {}", error);
            return ExitCode::from(EXIT_SETUP_FAILED);
        }
    };

    for target in &arguments.targets {
        if let Err(error) = build_target(&arguments, &project, &project_directory, target) {
            log::error!(target: "resource_build", "target \"{}\" failed: {:#}", target, error);
            return ExitCode::from(EXIT_BUILD_FAILED);
        }
        log::info!(target: "resource_build", "target \"{}\" built", target);
    }

    ExitCode::SUCCESS
}

fn setup(arguments: &Arguments) -> Result<(ResourceProject, PathBuf)> {
    let project = ResourceProject::load(&arguments.project)?;
    let project_directory = arguments
        .project
        .parent()
        .ok_or_else(|| anyhow!("project path has no parent directory"))?
        .to_path_buf();

    let workspace = project_directory.join(&project.workspace_directory);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace \"{}\"", workspace.display()))?;
    Ok((project, project_directory))
}

fn build_target(
    arguments: &Arguments,
    project: &ResourceProject,
    project_directory: &Path,
    target: &str,
) -> Result<()> {
    if !project.plugins.iter().any(|plugin| plugin == target) {
        bail!("not a plugin of this project");
    }

    let source = project_directory
        .join(&project.plugin_directory_name)
        .join(target);
    if !source.is_dir() {
        bail!("plugin directory \"{}\" is missing", source.display());
    }

    let mut files = Vec::new();
    collect_files(&source, &source, &mut files)?;
    files.sort();
    log::debug!(target: "resource_build", "target \"{}\": {} files", target, files.len());

    let workspace = project_directory.join(&project.workspace_directory);
    match arguments.pack {
        PackMode::None => copy_target(&source, &workspace.join(target), &files),
        PackMode::Regular => {
            write_pack(&source, &workspace.join(format!("{}.pack", target)), &files, false)
        }
        PackMode::Interned => {
            write_pack(&source, &workspace.join(format!("{}.pack", target)), &files, true)
        }
    }
}

/// Collects files under `directory` as forward-slash paths relative to
/// `root`.
fn collect_files(root: &Path, directory: &Path, output: &mut Vec<String>) -> Result<()> {
    for item in std::fs::read_dir(directory)? {
        let item = item?;
        let path = item.path();
        if path.is_dir() {
            collect_files(root, &path, output)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("walk stays under the root")
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            output.push(relative);
        }
    }
    Ok(())
}

fn copy_target(source: &Path, destination: &Path, files: &[String]) -> Result<()> {
    for relative in files {
        let from = source.join(relative);
        let to = destination.join(relative);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&from, &to)
            .with_context(|| format!("copying \"{}\"", from.display()))?;
    }
    Ok(())
}

fn write_pack(source: &Path, pack_path: &Path, files: &[String], interned: bool) -> Result<()> {
    let registry = if interned {
        Some(collect_type_names(source, files)?)
    } else {
        None
    };

    let mut builder = PackBuilder::create(pack_path)?;
    if let Some(names) = &registry {
        let text = ron::ser::to_string_pretty(names, ron::ser::PrettyConfig::default())?;
        builder.add_entry(STRING_REGISTRY_FILE, text.as_bytes())?;
    }

    for relative in files {
        let bytes = std::fs::read(source.join(relative))
            .with_context(|| format!("reading \"{}\"", relative))?;

        let payload = match (&registry, relative.ends_with(".bin")) {
            (Some(names), true) => {
                let (header, _) = peek_binary_header(&bytes)
                    .map_err(|error| anyhow!("bad type header in \"{}\": {}", relative, error))?;
                match header {
                    TypeHeader::Literal(name) => {
                        let index = names
                            .iter()
                            .position(|known| known == &name)
                            .expect("registry collected from the same files") as u32;
                        intern_binary_header(&bytes, index)
                            .map_err(|error| anyhow!("{}", error))?
                    }
                    TypeHeader::RegistryIndex(_) => bytes,
                }
            }
            _ => bytes,
        };

        builder.add_entry(relative, &payload)?;
    }

    builder.finish()?;
    Ok(())
}

/// Type names referenced by native resources of the target, sorted for a
/// stable registry.
fn collect_type_names(source: &Path, files: &[String]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for relative in files {
        let name = if relative.ends_with(".bin") {
            let bytes = std::fs::read(source.join(relative))?;
            match peek_binary_header(&bytes) {
                Ok((TypeHeader::Literal(name), _)) => Some(name),
                _ => None,
            }
        } else if relative.ends_with(".rd") {
            let text = std::fs::read_to_string(source.join(relative))?;
            peek_readable_type(&text).ok()
        } else {
            None
        };

        if let Some(name) = name {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}
