use anyhow::{Context, Result};
use depth_blobs::blob_tracker::BlobListener;
use depth_blobs::cli::Args;
use depth_blobs::depth_source::{DepthSource, SimulatedDepthSource};
use depth_blobs::pipeline::BlobPipeline;
use depth_blobs::point_cloud::Point3;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Reports identity transitions to the log.
struct LogListener;

impl BlobListener for LogListener {
    fn blob_on(&mut self, centroid: Point3, id: u32, order: usize) {
        info!("blob on  id={} order={} at ({:.2}, {:.2}, {:.2})", id, order, centroid.x, centroid.y, centroid.z);
    }

    fn blob_moved(&mut self, centroid: Point3, id: u32, order: usize) {
        debug!("blob moved id={} order={} to ({:.2}, {:.2}, {:.2})", id, order, centroid.x, centroid.y, centroid.z);
    }

    fn blob_off(&mut self, centroid: Point3, id: u32, order: usize) {
        info!("blob off id={} order={} last at ({:.2}, {:.2}, {:.2})", id, order, centroid.x, centroid.y, centroid.z);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    args.setup_logging()?;

    info!("Starting depth-blobs");

    let result = run_application(args).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_application(args: Args) -> Result<()> {
    let config = args.pipeline_config().context("Invalid blob configuration")?;

    let mut source = SimulatedDepthSource::new(args.width, args.height, args.people);
    if args.frames > 0 {
        source = source.with_frame_limit(args.frames);
    }

    let (width, height) = source.resolution();
    let mut pipeline = BlobPipeline::new(width, height, config);
    pipeline.request_recalibration(Instant::now());

    let mut listener = LogListener;
    let frame_duration = args.frame_duration();
    let mut last_frame_time = Instant::now();

    loop {
        let now = Instant::now();
        let elapsed = now.duration_since(last_frame_time);

        if elapsed >= frame_duration {
            let Some(report) = pipeline
                .poll(&mut source, now)
                .context("Frame processing failed")?
            else {
                info!("Depth source exhausted");
                break;
            };

            if let Some(countdown) = report.countdown {
                info!("Background snapshot in {}ms", countdown.as_millis());
            }
            for event in &report.events {
                event.dispatch(&mut listener);
            }
            if report.frame_id % 30 == 0 {
                let stats = pipeline.get_stats();
                info!(
                    "Frame {}: {} blobs, {} tracked, {}ms",
                    stats.frame_count,
                    report.blobs.len(),
                    stats.tracked_blobs,
                    report.processing_time.as_millis()
                );
            }
            last_frame_time = now;
        }

        let sleep_time = frame_duration.saturating_sub(now.elapsed());
        if sleep_time > Duration::from_millis(1) {
            sleep(sleep_time).await;
        }
    }

    for tracked in pipeline.tracker().blobs() {
        info!("id {} walked {} frames", tracked.id, tracked.trajectory().len());
    }

    Ok(())
}
