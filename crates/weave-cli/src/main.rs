// Weave
// Copyright (C) 2025 Loomworks

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::debug;
use weave_compiler::{Compiler, Optimization, ScopePaths};
use weave_core::Composition;
use weave_core::source::{SourceCompileRequest, SourceCompilerRegistry};

/// Compiler for the Weave dataflow language.
#[derive(Parser, Debug)]
#[command(name = "weave", about = "Compile and link Weave compositions and modules")]
pub struct Cli {
    /// Composition (.weave) or module source to compile
    pub input: Option<PathBuf>,

    /// Output path for the executable, dynamic library, or compiled module
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Additional header search path (repeatable)
    #[arg(short = 'I', long = "header-search-path")]
    pub header_search_path: Vec<PathBuf>,

    /// List the installed node classes, optionally as a Graphviz digraph
    #[arg(long, value_name = "FORMAT", num_args = 0..=1, default_missing_value = "list")]
    pub list_node_classes: Option<String>,

    /// Target triple to compile for
    #[arg(long)]
    pub target: Option<String>,

    /// Print debug-level progress information
    #[arg(short, long)]
    pub verbose: bool,

    /// Whether linking may reuse prebuilt module caches
    #[arg(long, value_enum, default_value = "on")]
    pub optimization: OptimizationArg,

    /// Prebuild the built-in scope's module caches into a framework folder
    #[arg(long, value_name = "FRAMEWORK_PATH")]
    pub generate_builtin_module_caches: Option<PathBuf>,

    /// Write the built-in scope's compiled modules into a framework folder
    #[arg(long, value_name = "FRAMEWORK_PATH")]
    pub generate_builtin_modules: Option<PathBuf>,

    /// Also emit a C header for a composition built as a dynamic library
    #[arg(long)]
    pub generate_header_file: bool,

    /// Write a Makefile-style depfile for build-system integration
    #[arg(long, value_name = "PATH")]
    pub dependency_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptimizationArg {
    Off,
    On,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let target = cli.target.clone().unwrap_or_else(weave_common::default_target);
    let composition_path = cli.input.as_deref().filter(|p| p.extension().is_some_and(|e| e == "weave"));
    let compiler = Compiler::new(&target, ScopePaths::default_paths(), composition_path);

    if let Some(path) = &cli.generate_builtin_modules {
        let written = compiler.generate_builtin_modules(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        debug!(written, "wrote built-in modules");
        return Ok(());
    }
    if let Some(path) = &cli.generate_builtin_module_caches {
        compiler.generate_builtin_module_caches(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        return Ok(());
    }
    if let Some(format) = &cli.list_node_classes {
        list_node_classes(&compiler, format);
        return Ok(());
    }

    let Some(input) = &cli.input else {
        bail!("no input file; pass a composition (.weave) or a module source");
    };
    match input.extension().and_then(|e| e.to_str()) {
        Some("weave") => compile_and_link_composition(&cli, &compiler, input),
        Some(_) => compile_module_source(&cli, &target, input),
        None => bail!("{} has no recognizable file extension", input.display()),
    }
}

fn list_node_classes(compiler: &Compiler, format: &str) {
    let node_classes = compiler.list_node_classes();
    if format == "dot" {
        println!("digraph nodeClasses {{");
        for (key, module) in &node_classes {
            println!("    \"{key}\";");
            for dependency in &module.dependencies {
                if node_classes.contains_key(dependency) {
                    println!("    \"{key}\" -> \"{dependency}\";");
                }
            }
        }
        println!("}}");
    } else {
        for key in node_classes.keys() {
            println!("{key}");
        }
    }
}

fn compile_and_link_composition(cli: &Cli, compiler: &Compiler, input: &Path) -> Result<()> {
    let composition = Composition::parse_file(input).map_err(|e| anyhow::anyhow!("{e}"))?;
    let compiled = compiler.compile_composition(&composition).map_err(|e| anyhow::anyhow!("{e}"))?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| input.with_extension(""));
    let optimization = match cli.optimization {
        OptimizationArg::On => Optimization::ExistingModuleCaches,
        OptimizationArg::Off => Optimization::NoModuleCaches,
    };
    let is_dylib = output.extension().is_some_and(|e| e == "dylib" || e == "so");
    if is_dylib {
        compiler
            .link_composition_to_dynamic_library(&compiled, &output, optimization)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    } else {
        compiler
            .link_composition_to_executable(&compiled, &output, optimization)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    if let Some(depfile) = &cli.dependency_output {
        compiler.write_dependency_file(&compiled, &output, depfile).map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    if cli.generate_header_file {
        let header = output.with_extension("h");
        compiler.generate_header_file(&compiled, &header).map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

fn compile_module_source(cli: &Cli, target: &str, input: &Path) -> Result<()> {
    let source_text = std::fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let key = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .context("input file has no stem")?;
    let request = SourceCompileRequest {
        key: key.clone(),
        source_path: input.to_path_buf(),
        source_text,
        target: target.to_string(),
        header_search_paths: cli.header_search_path.clone(),
    };
    let module = SourceCompilerRegistry::shared().compile(&request).map_err(|e| anyhow::anyhow!("{e}"))?;
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| input.with_extension(weave_core::module::COMPILED_MODULE_EXTENSION));
    std::fs::write(&output, module.to_artifact_bytes()).with_context(|| format!("writing {}", output.display()))?;
    debug!(key = %key, output = %output.display(), "compiled module source");
    Ok(())
}
