//! slicekit CLI - slice multi-plate projects from the command line
//!
//! Usage:
//!   slicekit slice <model.json> --printer x1c --config overrides.toml -o out/
//!   slicekit plates <model.json> --plates 2
//!   slicekit check-filaments <model.json> --printer h2d --config filaments.toml

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slicekit_config::{DynamicConfig, PrinterProfile};
use slicekit_model::Model;
use slicekit_plate::PartPlateList;
use slicekit_print::{compat, NozzleFilamentRules, ToolpathDumpExporter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "slicekit")]
#[command(author, version, about = "Slice multi-plate 3D printing projects", long_about = None)]
struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Model file (JSON)
    #[arg(value_name = "MODEL")]
    input: PathBuf,

    /// Config files layered over the defaults, in order (TOML or JSON)
    #[arg(short, long, value_name = "CONFIG")]
    config: Vec<PathBuf>,

    /// Printer profile: generic, x1c or h2d
    #[arg(short, long, default_value = "generic")]
    printer: String,

    /// Number of plates to lay out
    #[arg(long, default_value_t = 1)]
    plates: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Slice every plate and write one toolpath file per plate
    Slice {
        #[command(flatten)]
        project: ProjectArgs,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Slice only this plate (1-based)
        #[arg(long)]
        plate: Option<usize>,
    },
    /// Show which instances landed on which plate
    Plates {
        #[command(flatten)]
        project: ProjectArgs,

        /// Dump the plates as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check filament, nozzle and extruder compatibility per plate
    CheckFilaments {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match cli.command {
        Commands::Slice {
            project,
            output,
            plate,
        } => cmd_slice(&project, &output, plate),
        Commands::Plates { project, json } => cmd_plates(&project, json),
        Commands::CheckFilaments { project } => cmd_check_filaments(&project),
    }
}

struct Project {
    model: Model,
    config: DynamicConfig,
    plates: PartPlateList,
}

fn load_project(args: &ProjectArgs) -> Result<Project> {
    let mut model = Model::load(&args.input)
        .with_context(|| format!("Failed to load model {}", args.input.display()))?;
    let profile = PrinterProfile::by_name(&args.printer)
        .with_context(|| format!("Unknown printer '{}'", args.printer))?;

    let mut config = DynamicConfig::defaults();
    profile.apply_to(&mut config);
    for path in &args.config {
        let layer = DynamicConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
        config.apply(&layer);
    }

    let mut plates = PartPlateList::from_profile(&profile);
    for _ in 1..args.plates.max(1) {
        plates.create_plate(&mut model, false)?;
    }
    plates.set_filament_count(config.filament_count());
    plates.on_extruder_count_changed(config.extruder_count());
    plates.reload_all_objects(&model, false)?;
    info!(
        objects = model.objects.len(),
        plates = plates.plate_count(),
        printer = %profile.name,
        "project loaded"
    );

    Ok(Project {
        model,
        config,
        plates,
    })
}

fn plate_arg(plates: &PartPlateList, plate: usize) -> Result<usize> {
    let count = plates.plate_count();
    if plate == 0 || plate > count {
        anyhow::bail!("Plate {} does not exist (1..={})", plate, count);
    }
    Ok(plate - 1)
}

fn export_plate(project: &mut Project, index: usize, dir: &Path) -> Result<()> {
    let path = dir.join(format!("plate_{}.json", index + 1));
    let result = project
        .plates
        .export_plate_gcode(index, &path, &ToolpathDumpExporter)
        .with_context(|| format!("Failed to export plate {}", index + 1))?;
    let filament: f64 = result.filament_used_mm.iter().sum();
    println!(
        "Plate {}: {} layers, {:.1} min, {:.0} mm filament -> {}",
        index + 1,
        result.layer_count,
        result.print_time_seconds / 60.0,
        filament,
        path.display()
    );
    Ok(())
}

fn cmd_slice(args: &ProjectArgs, output: &Path, plate: Option<usize>) -> Result<()> {
    let mut project = load_project(args)?;
    fs::create_dir_all(output).with_context(|| format!("Failed to create {}", output.display()))?;

    if let Some(plate) = plate {
        let index = plate_arg(&project.plates, plate)?;
        let warnings = project
            .plates
            .slice_plate(&project.model, index, &project.config)
            .with_context(|| format!("Failed to slice plate {}", plate))?;
        for w in warnings {
            warn!(plate, object = %w.object_id, "{}", w.message);
        }
        return export_plate(&mut project, index, output);
    }

    let report = project.plates.slice_all(&project.model, &project.config);
    for ((plate, object), messages) in &report.warnings {
        for message in messages {
            warn!(plate = plate + 1, %object, "{}", message);
        }
    }
    for &index in &report.sliced {
        export_plate(&mut project, index, output)?;
    }
    for (plate, error) in &report.plate_errors {
        eprintln!("Plate {} failed: {}", plate + 1, error);
    }
    for ((plate, object), message) in &report.object_errors {
        eprintln!("Plate {} object {} failed: {}", plate + 1, object, message);
    }

    if report.sliced.is_empty() && report.is_success() {
        println!("Nothing to slice");
    }
    if !report.is_success() {
        anyhow::bail!("{} plate(s) failed", report.failed_plates().len());
    }
    Ok(())
}

fn cmd_plates(args: &ProjectArgs, json: bool) -> Result<()> {
    let project = load_project(args)?;
    let plates = &project.plates;

    if json {
        println!("{}", serde_json::to_string_pretty(plates.plates())?);
        return Ok(());
    }

    let name = |o: usize| {
        project
            .model
            .objects
            .get(o)
            .map(|obj| obj.name.as_str())
            .unwrap_or("?")
    };
    for plate in plates.plates() {
        let state = if plate.empty() {
            "empty"
        } else if plate.can_slice() {
            "ready"
        } else {
            "objects outside"
        };
        let origin = plate.origin();
        println!(
            "Plate {} at ({:.1}, {:.1}): {} instance(s), {}",
            plate.index() + 1,
            origin.x,
            origin.y,
            plate.instances().len(),
            state
        );
        for &(o, i) in plate.instances() {
            let outside = if plate.contain_instance_totally((o, i)) { "" } else { " (outside)" };
            println!("  {} #{}{}", name(o), i + 1, outside);
        }
    }

    let unprintable = plates.unprintable_plate();
    if !unprintable.empty() {
        println!("Off plate: {} instance(s)", unprintable.instances().len());
        for &(o, i) in unprintable.instances() {
            println!("  {} #{}", name(o), i + 1);
        }
    }
    Ok(())
}

fn cmd_check_filaments(args: &ProjectArgs) -> Result<()> {
    let project = load_project(args)?;
    let rules = NozzleFilamentRules::builtin();
    let mut failures = 0;

    for index in project.plates.get_nonempty_plate_list() {
        let Some(plate) = project.plates.plate(index) else {
            continue;
        };
        let filaments = plate.get_extruders(&project.model, &project.config);
        let types: Vec<String> = filaments
            .iter()
            .map(|&f| format!("{} ({})", f, compat::filament_type(&project.config, f)))
            .collect();
        println!("Plate {}: filaments {}", index + 1, types.join(", "));

        let checks = [
            plate.check_filament_printable(&project.model, &project.config),
            plate.check_compatible_of_nozzle_and_filament(&project.model, &project.config, &rules),
        ];
        for result in checks {
            if let Err(e) = result {
                failures += 1;
                println!("  {}", e);
            }
        }
        if !plate.check_mixture_of_pla_and_petg(&project.model, &project.config) {
            println!("  warning: PLA and PETG on the same plate may not bond");
        }
    }

    if failures > 0 {
        anyhow::bail!("{} compatibility problem(s) found", failures);
    }
    println!("All plates compatible");
    Ok(())
}
