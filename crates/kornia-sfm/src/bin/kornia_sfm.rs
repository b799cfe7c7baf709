use argh::FromArgs;
use std::path::PathBuf;

use kornia_sfm::io::{colmap, json};
use kornia_sfm::{SfmConfig, SfmInput, SfmPipeline};

#[derive(FromArgs)]
/// Run global Structure-from-Motion on precomputed keypoints and correspondences
struct Args {
    /// path to the input JSON (cameras, keypoints, correspondences, priors)
    #[argh(option, short = 'i')]
    input: PathBuf,

    /// path to a JSON configuration, defaults are used for missing fields
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// output directory
    #[argh(option, short = 'o')]
    output: PathBuf,

    /// also write each reconstruction as a COLMAP text model
    #[argh(switch)]
    colmap: bool,

    /// print the effective configuration and exit
    #[argh(switch)]
    print_config: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => SfmConfig::from_json_file(path)?,
        None => SfmConfig::default(),
    };
    if args.print_config {
        println!("{}", config.to_json_string()?);
        return Ok(());
    }

    let input: SfmInput = json::read_json(&args.input)?;
    log::info!(
        "loaded {} cameras and {} pairs from {:?}",
        input.num_cameras,
        input.correspondences.len(),
        args.input
    );

    let pipeline = SfmPipeline::new(config)?;
    let output = pipeline.run(&input)?;

    std::fs::create_dir_all(&args.output)?;
    json::write_json(args.output.join("report.json"), &output.report)?;
    for (i, rec) in output.reconstructions.iter().enumerate() {
        json::write_reconstruction(args.output.join(format!("reconstruction_{}.json", i)), rec)?;
        if args.colmap {
            colmap::write_text_model(args.output.join(format!("colmap_{}", i)), rec)?;
        }
        let stats = rec.stats();
        println!(
            "reconstruction {}: {} cameras, {} tracks, mean track length {:.2}, reprojection error mean {:.3} px median {:.3} px{}",
            i,
            stats.num_cameras,
            stats.num_tracks,
            stats.mean_track_length,
            stats.mean_reprojection_error,
            stats.median_reprojection_error,
            if rec.refined { "" } else { " (unrefined)" }
        );
    }
    if !output.report.unreconstructed.is_empty() {
        println!("unreconstructed cameras: {:?}", output.report.unreconstructed);
    }
    Ok(())
}
