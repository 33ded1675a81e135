//! roi_admin - manage per-camera regions of interest in the shared database
//!
//! Running pipelines pick up changes within their ROI cache TTL.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use plate_capture::config::validate_camera_id;
use plate_capture::trigger::{RoiProvider, RoiRect, SqliteRoiStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage plate capture regions of interest")]
struct Args {
    /// Path to the shared plate capture database.
    #[arg(long, env = "PLATE_CAPTURE_DB_PATH", default_value = "plate_capture.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a normalized rectangle, e.g. `0.1,0.3,0.9,1.0`.
    Set { camera: String, roi: String },
    /// Print the stored rectangle for a camera.
    Get { camera: String },
    /// Remove the stored rectangle; the camera falls back to configuration.
    Clear { camera: String },
    /// Print every stored rectangle.
    List,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = SqliteRoiStore::open(&args.db)?;

    match args.command {
        Command::Set { camera, roi } => {
            let camera = camera.to_ascii_lowercase();
            validate_camera_id(&camera)?;
            let rect = RoiRect::parse(&roi)?;
            store.set(&camera, &rect)?;
            println!("{} {}", camera, rect);
        }
        Command::Get { camera } => {
            let camera = camera.to_ascii_lowercase();
            match store.get(&camera)? {
                Some(rect) => println!("{} {}", camera, rect),
                None => return Err(anyhow!("no ROI stored for {}", camera)),
            }
        }
        Command::Clear { camera } => {
            let camera = camera.to_ascii_lowercase();
            if store.clear(&camera)? {
                println!("cleared {}", camera);
            } else {
                println!("nothing stored for {}", camera);
            }
        }
        Command::List => {
            for (camera, rect) in store.list()? {
                println!("{} {}", camera, rect);
            }
        }
    }
    Ok(())
}
