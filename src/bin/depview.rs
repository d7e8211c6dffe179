extern crate dependency_viewer;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use dependency_viewer::analysis::{Analysis, CheckReport, Dependency, ImportStatus, NodeId};
use dependency_viewer::common::{decanonicalize, path_to_string, readable_canonical_path};
use dependency_viewer::knowndlls::KnownDllRegistry;
use dependency_viewer::logging::init_tracing;
use dependency_viewer::lookup_path::LookupPath;
use dependency_viewer::pe::demangle_symbol;
use dependency_viewer::processor::analyze;
use dependency_viewer::query::LookupQuery;
use dependency_viewer::system::WindowsSystem;
use fs_err as fs;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "depview", version, about = "Dependency viewer for Windows PE files")]
struct Cli {
    /// Target files (.exe or .dll)
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Path for output in JSON format
    #[arg(short = 'j', long)]
    output_json_path: Option<PathBuf>,

    /// Maximum depth of the printed tree (default: unlimited)
    #[arg(short = 'd', long)]
    max_depth: Option<usize>,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Include system DLLs in the output
    #[arg(long)]
    print_system_dlls: bool,

    /// Print the full path of every module instead of its folder
    #[arg(long)]
    full_paths: bool,

    /// Report the DLLs and symbols that could not be resolved
    #[arg(long)]
    check_symbols: bool,

    /// Undecorate MSVC symbol names in reports
    #[arg(long)]
    undecorate: bool,

    /// Print the list of unique modules
    #[arg(long)]
    modules: bool,

    /// Windows partition to use for system DLLs lookup (if not specified, the host system on
    /// Windows, elsewhere the partition where the first INPUT lies, if valid)
    #[arg(short = 'w', long)]
    windows_root: Option<PathBuf>,

    /// Working directory to be considered in the DLL lookup path (default: directory of the first INPUT)
    #[arg(short = 'k', long)]
    workdir: Option<PathBuf>,

    /// User path to be considered in the DLL lookup path, entries separated by ';'
    #[arg(short = 'a', long = "userpath", value_name = "PATH")]
    user_path: Option<String>,

    /// File listing the known DLLs, one per line
    #[arg(long)]
    known_dlls: Option<PathBuf>,

    /// Directory the known DLLs are mapped from (default: the system directory)
    #[arg(long)]
    known_dlls_dir: Option<PathBuf>,

    /// Read the complete DLL lookup path from a .dwp file (Dependency Walker's format)
    #[arg(long)]
    dwp_file_path: Option<PathBuf>,

    /// Emulate SafeDllSearchMode=0: the working directory is searched right after the application directory
    #[arg(long)]
    unsafe_dll_search: bool,
}

fn display_path(path: &Path) -> String {
    readable_canonical_path(path).unwrap_or_else(|_| path_to_string(path))
}

struct TreePrinter<'a> {
    analysis: &'a Analysis,
    cli: &'a Cli,
    expanded: HashSet<NodeId>,
}

impl<'a> TreePrinter<'a> {
    fn new(analysis: &'a Analysis, cli: &'a Cli) -> Self {
        Self {
            analysis,
            cli,
            expanded: HashSet::new(),
        }
    }

    fn location(&self, id: NodeId) -> String {
        let node = self.analysis.node(id);
        match node.path() {
            None => "not found".to_owned(),
            Some(path) if self.cli.full_paths => display_path(path),
            Some(path) => path
                .parent()
                .map(display_path)
                .unwrap_or_else(|| "INVALID".to_owned()),
        }
    }

    fn visit(&mut self, id: NodeId, edge: Option<&Dependency>, ancestors: &mut Vec<NodeId>) {
        let analysis = self.analysis;
        let depth = ancestors.len();
        let node = analysis.node(id);
        if (!self.cli.print_system_dlls && node.is_system())
            || self.cli.max_depth.is_some_and(|d| depth >= d)
        {
            return;
        }

        let mut tags = Vec::new();
        if node.is_known_dll() {
            tags.push("[Known DLL]");
        }
        if !node.diagnostics.is_empty() {
            tags.push("[invalid]");
        }
        if let Some(edge) = edge {
            if edge.delay_load {
                tags.push("[delay-load]");
            }
            if node.is_found() && edge.status() == ImportStatus::Unresolved {
                tags.push("[missing symbols]");
            }
        }
        let is_cycle = ancestors.contains(&id);
        let seen = !is_cycle && !node.dependencies.is_empty() && self.expanded.contains(&id);
        if is_cycle {
            tags.push("[cycle]");
        } else if seen {
            tags.push("[see above]");
        }
        println!(
            "{}{} => {} {}",
            "\t".repeat(depth),
            node.display_name(),
            self.location(id),
            tags.join(" ")
        );

        if is_cycle || seen {
            return;
        }
        self.expanded.insert(id);
        ancestors.push(id);
        for dependency in &node.dependencies {
            self.visit(dependency.target, Some(dependency), ancestors);
        }
        ancestors.pop();
    }
}

fn print_modules(analysis: &Analysis, cli: &Cli) {
    println!("\nModules:\n");
    for module in analysis.modules() {
        if !cli.print_system_dlls && module.is_system() {
            continue;
        }
        let location = match module.path() {
            Some(path) => display_path(path),
            None => "not found".to_owned(),
        };
        println!(
            "{} (depth {}) => {}",
            module.display_name(),
            module.depth,
            location
        );
        if module.is_valid_pe() {
            println!(
                "\t{} imports, {} exports",
                module.import_count(),
                module.export_count()
            );
        }
        for diagnostic in &module.diagnostics {
            println!("\t{diagnostic}");
        }
    }
}

fn print_report(report: &CheckReport, undecorate: bool) {
    if !report.not_found_libraries.is_empty() {
        println!("Missing libraries detected!");
        println!("[Importing executable, missing dependencies]\n");
        for (importer, missing_dependencies) in &report.not_found_libraries {
            println!("{importer}");
            for missing_import_dll in missing_dependencies {
                println!("\t{missing_import_dll}");
            }
        }
        println!();
    } else {
        println!("No missing libraries detected");
    }

    if !report.not_found_symbols.is_empty() {
        println!("\nMissing symbols detected!");
        println!("[Importing executable, exporting executable, missing symbols]\n");
        for (filename, missing_imports) in &report.not_found_symbols {
            println!("{filename}");
            for (missing_import_dll, missing_symbols) in missing_imports {
                println!("\t{missing_import_dll}");
                for missing_symbol in missing_symbols {
                    let symbol = undecorate
                        .then(|| demangle_symbol(missing_symbol))
                        .flatten()
                        .unwrap_or_else(|| missing_symbol.clone());
                    println!("\t\t{symbol}");
                }
            }
        }
    } else {
        println!("No missing symbols detected");
    }
}

fn build_query(cli: &Cli) -> anyhow::Result<LookupQuery> {
    let mut roots = Vec::new();
    for input in &cli.inputs {
        if !input.exists() {
            bail!(
                "Specified file not found at {}\nCurrent working directory: {}",
                input.display(),
                std::env::current_dir()?.display(),
            );
        }
        if input.is_dir() {
            bail!(
                "The specified path is a directory, not a PE executable file: {}",
                input.display(),
            );
        }
        roots.push(fs::canonicalize(input)?);
    }

    let mut query = LookupQuery::deduce_from_executable_locations(&roots)?;

    // overrides
    if let Some(windows_root) = &cli.windows_root {
        query.system = Some(WindowsSystem::from_root(windows_root).with_context(|| {
            format!("no Windows installation found at {}", windows_root.display())
        })?);
    } else if let Some(system) = &query.system {
        info!(
            "Windows partition root not specified, assumed {}",
            path_to_string(&system.win_dir)
        );
    } else {
        warn!("Windows partition root not specified, and executable doesn't lie in one; system DLL imports will not be resolved");
    }

    if cli.unsafe_dll_search {
        match query.system.as_mut() {
            Some(system) => system.safe_dll_search_mode_on = Some(false),
            None => warn!("--unsafe-dll-search has no effect without a Windows system"),
        }
    }

    if cli.known_dlls.is_some() || cli.known_dlls_dir.is_some() {
        let system = query
            .system
            .as_mut()
            .context("known DLLs can only be used with a Windows system; specify --windows-root")?;
        let directory = cli
            .known_dlls_dir
            .clone()
            .unwrap_or_else(|| system.sys_dir.clone());
        let registry = match &cli.known_dlls {
            Some(list) => KnownDllRegistry::from_file(list, directory)
                .with_context(|| format!("couldn't read known DLL list {}", list.display()))?,
            None => match system.known_dlls.take() {
                Some(registry) => registry.with_directory(directory),
                None => KnownDllRegistry::windows_default(directory),
            },
        };
        system.known_dlls = Some(registry);
    }

    if let Some(workdir) = &cli.workdir {
        query.target.working_dir = workdir.clone();
    } else {
        info!(
            "Working directory not specified, assuming directory of executable: {}",
            decanonicalize(&path_to_string(&query.target.working_dir))
        );
    }

    if let Some(user_path) = &cli.user_path {
        for entry in user_path.split(';').filter(|s| !s.is_empty()) {
            let p = Path::new(entry);
            if p.exists() {
                query.target.user_path.push(fs::canonicalize(p)?);
            } else {
                warn!("Skipping non-existing path entry {entry}");
            }
        }
    }

    Ok(query)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let query = build_query(&cli)?;

    let lookup_path = match &cli.dwp_file_path {
        Some(dwp_file_path) => LookupPath::from_dwp_file(dwp_file_path, &query)?,
        None => LookupPath::deduce(&query),
    };

    if let Some(kd) = lookup_path.known_dlls() {
        info!(
            "Known DLLs ({}) mapped from {}",
            kd.names().len(),
            kd.directory().display()
        );
    }
    let search_path: Vec<String> = lookup_path
        .search_path()
        .iter()
        .map(|p| decanonicalize(&path_to_string(p)))
        .collect();
    info!("Search path: {}", search_path.join(", "));

    let analysis = analyze(&query, &lookup_path)?;

    // printing depth-first
    let mut printer = TreePrinter::new(&analysis, &cli);
    for &root in analysis.roots() {
        println!();
        printer.visit(root, None, &mut Vec::new());
    }

    if cli.modules {
        print_modules(&analysis, &cli);
    }

    if cli.check_symbols {
        println!("\nChecking symbols...\n");
        print_report(&analysis.check(), cli.undecorate);
    }

    if let Some(json_output_path) = &cli.output_json_path {
        let js = serde_json::to_string_pretty(&analysis).context("Error serializing")?;
        let out_display = json_output_path.display();
        fs::write(json_output_path, js).with_context(|| format!("couldn't write to {out_display}"))?;
        info!("successfully wrote to {out_display}");
    }

    Ok(())
}
