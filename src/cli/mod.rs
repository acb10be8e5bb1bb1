//! CLI subcommands: init, check, tasks, compile, run.

use crate::core::compiler;
use crate::core::error::{Error, ResolutionError, Result};
use crate::core::types::BashScript;
use crate::core::{overlay, parser, renderer};
use crate::transport::{self, Layer};
use clap::Subcommand;
use std::path::{Path, PathBuf};

const DEFAULT_FILE: &str = "qwl.yaml";

const STARTER: &str = r#"name: my-project

vars:
  greeting: hello

tasks:
  hello:
    desc: Print a greeting
    run: echo "{{ greeting }} from {{ module_name }}"
"#;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a starter qwl.yaml
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Compile without emitting, report function count
    Check {
        /// Path to the task document
        #[arg(short, long, default_value = DEFAULT_FILE)]
        file: PathBuf,

        /// Presets to apply (repeatable or comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        preset: Vec<String>,
    },

    /// List root tasks with descriptions
    Tasks {
        /// Path to the task document
        #[arg(short, long, default_value = DEFAULT_FILE)]
        file: PathBuf,

        /// Presets to apply (repeatable or comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        preset: Vec<String>,
    },

    /// Compile to a bash script
    Compile {
        /// Path to the task document
        #[arg(short, long, default_value = DEFAULT_FILE)]
        file: PathBuf,

        /// Presets to apply (repeatable or comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        preset: Vec<String>,

        /// Write the script here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the script IR as JSON instead of bash
        #[arg(long)]
        ir: bool,
    },

    /// Compile and run a task through an execution layer
    Run {
        /// Path to the task document
        #[arg(short, long, default_value = DEFAULT_FILE)]
        file: PathBuf,

        /// Presets to apply (repeatable or comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        preset: Vec<String>,

        /// Execution layer: local, ssh:<user@host>[#<key>], docker:<image>
        #[arg(long, default_value = "local")]
        layer: String,

        /// Root task to run (default: help)
        task: Option<String>,

        /// Arguments passed to the task
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Dispatch a CLI command. Returns the process exit code.
pub fn dispatch(cmd: Commands) -> Result<i32> {
    match cmd {
        Commands::Init { path } => cmd_init(&path).map(|_| 0),
        Commands::Check { file, preset } => cmd_check(&file, &preset).map(|_| 0),
        Commands::Tasks { file, preset } => cmd_tasks(&file, &preset).map(|_| 0),
        Commands::Compile {
            file,
            preset,
            output,
            ir,
        } => cmd_compile(&file, &preset, output.as_deref(), ir).map(|_| 0),
        Commands::Run {
            file,
            preset,
            layer,
            task,
            args,
        } => cmd_run(&file, &preset, &layer, task.as_deref(), &args),
    }
}

/// Empty preset list means "use the module's defaults".
fn presets_opt(preset: &[String]) -> Option<&[String]> {
    if preset.is_empty() {
        None
    } else {
        Some(preset)
    }
}

fn compile_script(file: &Path, preset: &[String]) -> Result<BashScript> {
    compiler::compile_file(file, presets_opt(preset))
}

fn cmd_init(path: &Path) -> Result<()> {
    let doc_path = path.join(DEFAULT_FILE);
    if doc_path.exists() {
        return Err(Error::AlreadyExists { path: doc_path });
    }
    std::fs::create_dir_all(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(&doc_path, STARTER).map_err(|source| Error::Io {
        path: doc_path.clone(),
        source,
    })?;
    println!("Created {}", doc_path.display());
    Ok(())
}

fn cmd_check(file: &Path, preset: &[String]) -> Result<()> {
    let script = compile_script(file, preset)?;
    let module = parser::parse_file(file)?;
    println!("OK: {} ({} functions)", module.name, script.functions.len());
    Ok(())
}

fn cmd_tasks(file: &Path, preset: &[String]) -> Result<()> {
    let module = parser::parse_file(file)?;
    let base = module
        .source_dir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let effective = overlay::effective_module(&module, &base, presets_opt(preset))?;
    let width = effective.tasks.keys().map(String::len).max().unwrap_or(0);
    for (name, task) in &effective.tasks {
        match &task.desc {
            Some(desc) => println!("  {:width$}  {}", name, desc, width = width),
            None => println!("  {}", name),
        }
    }
    Ok(())
}

fn cmd_compile(file: &Path, preset: &[String], output: Option<&Path>, ir: bool) -> Result<()> {
    let script = compile_script(file, preset)?;
    let text = if ir {
        let mut json = serde_json::to_string_pretty(&script)?;
        json.push('\n');
        json
    } else {
        renderer::render(&script)
    };
    match output {
        Some(out) => {
            write_executable(out, &text)?;
            eprintln!("Wrote {}", out.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn write_executable(path: &Path, text: &str) -> Result<()> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(path, text).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io_err)?;
    }
    Ok(())
}

fn cmd_run(
    file: &Path,
    preset: &[String],
    layer: &str,
    task: Option<&str>,
    args: &[String],
) -> Result<i32> {
    let layer = Layer::from_spec(layer)?;
    let script = compile_script(file, preset)?;

    let mut argv = Vec::new();
    if let Some(task) = task {
        let entry = script
            .entry_function(task)
            .ok_or_else(|| ResolutionError::UnknownTask {
                name: task.to_string(),
                available: script.available_tasks.join(", "),
            })?;
        argv.push(entry.name.clone());
        argv.extend(args.iter().cloned());
    }

    let out = transport::exec_script(&layer, &renderer::render(&script), &argv)?;
    print!("{}", out.stdout);
    eprint!("{}", out.stderr);
    Ok(out.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(DEFAULT_FILE);
        std::fs::write(&file, yaml).unwrap();
        (dir, file)
    }

    #[test]
    fn test_init_writes_compilable_starter() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let file = dir.path().join(DEFAULT_FILE);
        assert!(file.exists());
        let script = compile_script(&file, &[]).unwrap();
        assert_eq!(
            script.function("hello").unwrap().body,
            "echo \"hello from my-project\""
        );
    }

    #[test]
    fn test_init_already_exists() {
        let (dir, _file) = project("name: x\n");
        let err = cmd_init(dir.path()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_check_and_tasks() {
        let (_dir, file) = project("name: x\ntasks:\n  a:\n    desc: first\n    run: echo a\n  b: echo b\n");
        cmd_check(&file, &[]).unwrap();
        cmd_tasks(&file, &[]).unwrap();
    }

    #[test]
    fn test_check_reports_errors() {
        let (_dir, file) = project("name: x\ntasks:\n  a: echo {{ nope }}\n");
        assert!(cmd_check(&file, &[]).is_err());
    }

    #[test]
    fn test_compile_writes_executable_script() {
        let (dir, file) = project("name: x\ntasks:\n  hello: echo hello\n");
        let out = dir.path().join("run.sh");
        cmd_compile(&file, &[], Some(&out), false).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("#!/usr/bin/env bash"));
        assert!(text.contains("hello () {"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_compile_failure_writes_nothing() {
        let (dir, file) = project("name: x\ntasks:\n  a:\n    uses: bad\n");
        let out = dir.path().join("run.sh");
        assert!(cmd_compile(&file, &[], Some(&out), false).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_compile_ir_json() {
        let (dir, file) = project("name: x\ntasks:\n  hello: echo hello\n");
        let out = dir.path().join("ir.json");
        cmd_compile(&file, &[], Some(&out), true).unwrap();
        let ir: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(ir["available_tasks"][0], "hello");
        assert_eq!(ir["functions"][0]["name"], "hello");
    }

    #[test]
    fn test_compile_with_preset() {
        let (dir, file) = project(
            "name: x\nvars: {who: dev}\ntasks:\n  hi: echo {{ who }}\npresets:\n  prod:\n    vars: {who: prod}\n",
        );
        let out = dir.path().join("run.sh");
        cmd_compile(&file, &["prod".to_string()], Some(&out), false).unwrap();
        assert!(std::fs::read_to_string(&out).unwrap().contains("echo prod"));
        assert!(cmd_compile(&file, &["ghost".to_string()], None, false).is_err());
    }

    #[test]
    fn test_run_local_relays_exit_code() {
        let (_dir, file) = project(
            "name: x\ntasks:\n  ok: echo ok\n  fail: exit 3\n  greet: echo \"hi $1\"\n",
        );
        assert_eq!(cmd_run(&file, &[], "local", Some("ok"), &[]).unwrap(), 0);
        assert_eq!(cmd_run(&file, &[], "local", Some("fail"), &[]).unwrap(), 3);
        assert_eq!(
            cmd_run(&file, &[], "local", Some("greet"), &["you".to_string()]).unwrap(),
            0
        );
        assert_eq!(cmd_run(&file, &[], "local", None, &[]).unwrap(), 0);
        assert_eq!(cmd_run(&file, &[], "local", Some("help"), &[]).unwrap(), 0);
    }

    #[test]
    fn test_run_deduplicated_task() {
        let (_dir, file) = project("name: x\ntasks:\n  a: echo same\n  b: echo same\n");
        assert_eq!(cmd_run(&file, &[], "local", Some("b"), &[]).unwrap(), 0);
    }

    #[test]
    fn test_run_unknown_task() {
        let (_dir, file) = project("name: x\ntasks:\n  ok: echo ok\n");
        let err = cmd_run(&file, &[], "local", Some("nope"), &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnknownTask { .. })
        ));
        assert!(err.to_string().contains("available: ok"));
    }

    #[test]
    fn test_run_unknown_layer() {
        let (_dir, file) = project("name: x\ntasks:\n  ok: echo ok\n");
        let err = cmd_run(&file, &[], "k8s:pod", Some("ok"), &[]).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_dispatch_init() {
        let dir = tempfile::tempdir().unwrap();
        let code = dispatch(Commands::Init {
            path: dir.path().join("sub"),
        })
        .unwrap();
        assert_eq!(code, 0);
        assert!(dir.path().join("sub").join(DEFAULT_FILE).exists());
    }
}
