mod monitoring;

use clap::{Parser, Subcommand};
use lokeflash::{FlashOptions, Orchestrator, PartitionSelector};
use std::{
  fs::File,
  io::Write,
  path::PathBuf,
  process::ExitCode,
};

/// Thin demonstration binary over the `lokeflash` library: argument parsing
/// is a collaborator, not the flashing core, and stays minimal on purpose.
#[derive(Parser, Debug)]
#[command(
  author,
  version,
  about = "flash firmware partitions to Samsung devices in download mode",
  long_about = None
)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Confirm a known Samsung download-mode device is reachable.
  Detect,
  /// Download the device's partition table and print it.
  PrintPit {
    #[arg(long)]
    resume: bool,
  },
  /// Download the device's partition table and write it to a file.
  DownloadPit {
    output: PathBuf,
    #[arg(long)]
    reboot: bool,
    #[arg(long)]
    resume: bool,
  },
  /// Flash one or more `name=path` partition pairs.
  Flash {
    /// `partition=path` pairs, e.g. `BOOT=boot.img`.
    #[arg(required = true)]
    partitions: Vec<String>,
    /// Upload this PIT file before streaming partition data.
    #[arg(long)]
    pit: Option<PathBuf>,
    #[arg(long)]
    repartition: bool,
    #[arg(long)]
    reboot: bool,
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    tflash: bool,
  },
  /// End the session without flashing anything.
  Close {
    #[arg(long)]
    reboot: bool,
    #[arg(long)]
    resume: bool,
  },
  /// Reboot the device out of download mode.
  Reboot {
    #[arg(long)]
    resume: bool,
  },
}

fn main() -> ExitCode {
  monitoring::init_logger();

  match run(Args::parse().command) {
    Ok(()) => {
      tracing::info!("done!");
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!("{err}");
      ExitCode::FAILURE
    }
  }
}

fn run(command: Command) -> lokeflash::Result<()> {
  match command {
    Command::Detect => {
      let orchestrator = Orchestrator::connect(None)?;
      if orchestrator.detect() {
        tracing::info!("device found");
      }
      Ok(())
    }
    Command::PrintPit { resume } => {
      let orchestrator = Orchestrator::connect(None)?;
      let pit = orchestrator.print_pit(resume)?;
      println!("{pit}");
      Ok(())
    }
    Command::DownloadPit { output, reboot, resume } => {
      let orchestrator = Orchestrator::connect(None)?;
      let bytes = orchestrator.download_pit(reboot, resume)?;
      let mut file = File::create(&output)?;
      file.write_all(&bytes)?;
      tracing::info!(path = %output.display(), bytes = bytes.len(), "wrote PIT file");
      Ok(())
    }
    Command::Flash {
      partitions,
      pit,
      repartition,
      reboot,
      resume,
      tflash,
    } => {
      let callback = std::sync::Arc::new(|event: lokeflash::Event| {
        if let lokeflash::Event::FlashProgress(progress) = event {
          tracing::info!("{}: {:.1}%", progress.partition, progress.percent);
        }
      });

      let orchestrator = Orchestrator::connect(Some(callback))?;

      let mut inputs = Vec::with_capacity(partitions.len());
      for pair in &partitions {
        let (selector, path) = pair.split_once('=').ok_or_else(|| {
          lokeflash::Error::InvalidArgument(format!("expected `name=path`, got `{pair}`"))
        })?;
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let selector = match selector.parse::<u32>() {
          Ok(id) => PartitionSelector::Id(id),
          Err(_) => PartitionSelector::Name(selector.to_string()),
        };
        inputs.push((selector, Box::new(file) as Box<dyn std::io::Read>, len));
      }

      let pit_bytes = pit.map(std::fs::read).transpose()?;

      orchestrator.flash(
        inputs,
        FlashOptions {
          repartition,
          reboot_on_end: reboot,
          resume,
          tflash,
          pit: pit_bytes,
        },
      )
    }
    Command::Close { reboot, resume } => Orchestrator::connect(None)?.close_pc_screen(reboot, resume),
    Command::Reboot { resume } => Orchestrator::connect(None)?.reboot(resume),
  }
}
