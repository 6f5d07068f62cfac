use std::env;

use anyhow::Result;

use reign_engine::app::{GpuUnavailable, Viewer, ViewerOptions};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = ViewerOptions::parse(env::args().skip(1))?;
    let mut viewer = Viewer::load(&options)?;
    viewer.advance(options.frames);
    print!("{}", viewer.summary());

    if options.summary_only {
        return Ok(());
    }
    match viewer.render_png(&options) {
        Ok(()) => {
            println!(
                "Rendered {}x{} frame to {}",
                options.width,
                options.height,
                options.output.display()
            );
            Ok(())
        }
        Err(err) if err.downcast_ref::<GpuUnavailable>().is_some() => {
            eprintln!("{err}. Falling back to --summary-only mode.");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
