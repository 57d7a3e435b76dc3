use depth_blobs::depth_source::SimulatedDepthSource;
use depth_blobs::pipeline::{BlobPipeline, PipelineConfig};
use depth_blobs::point_cloud::Resolution;
use std::time::Instant;

const WIDTH: u32 = 512;
const HEIGHT: u32 = 424;
const FRAMES: u64 = 60;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_level(true)
        .with_target(false)
        .init();

    println!("=== Depth Blobs Performance Test ===");
    println!("{} simulated {}x{} frames per configuration\n", FRAMES, WIDTH, HEIGHT);

    let test_configs = [
        (Resolution::Low, "Low resolution (every 4th pixel)"),
        (Resolution::Medium, "Medium resolution (every 2nd pixel)"),
        (Resolution::High, "High resolution (every pixel)"),
    ];

    for (resolution, description) in test_configs {
        test_performance_with_resolution(resolution, description)?;
        println!();
    }

    Ok(())
}

fn test_performance_with_resolution(resolution: Resolution, description: &str) -> anyhow::Result<()> {
    println!("Testing: {}", description);

    let config = PipelineConfig {
        resolution,
        finder: depth_blobs::blob_finder::FinderConfig {
            min_points: depth_blobs::blob_finder::min_points_for(WIDTH, HEIGHT, resolution),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut source = SimulatedDepthSource::new(WIDTH, HEIGHT, 3).with_frame_limit(FRAMES);
    let mut pipeline = BlobPipeline::new(WIDTH, HEIGHT, config);

    let start_time = Instant::now();
    let mut slowest_ms = 0.0f64;
    let mut events = 0usize;

    while let Some(report) = pipeline.poll(&mut source, Instant::now())? {
        let frame_ms = report.processing_time.as_secs_f64() * 1000.0;
        slowest_ms = slowest_ms.max(frame_ms);
        events += report.events.len();

        if report.frame_id == 1 {
            println!("  First frame processed in: {:.2}ms", frame_ms);
        }
    }

    let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
    let avg_frame_ms = total_ms / FRAMES as f64;
    let theoretical_fps = 1000.0 / avg_frame_ms;

    println!("  Average per frame: {:.2}ms (slowest {:.2}ms)", avg_frame_ms, slowest_ms);
    println!("  Theoretical FPS: {:.1}", theoretical_fps);
    println!("  Blob events: {}, still tracked: {}", events, pipeline.tracker().blobs().len());

    if theoretical_fps >= 30.0 {
        println!("  ✅ Keeps up with a 30 FPS depth sensor");
    } else {
        println!("  ⚠️  Below 30 FPS");
    }

    Ok(())
}
