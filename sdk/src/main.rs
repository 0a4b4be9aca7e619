//! Prints what the pi-top reports about itself
//!
//! `pt-status` prints the state tree once. `pt-status watch` keeps running until ctrl-c,
//! logging case button presses and showing the battery level on the miniscreen.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use common::error::LogErrorExt;
use embedded_graphics::prelude::Point;
use sdk::{
    buttons::{CaseButtonId, CaseButtons},
    component::Component,
    system::Pitop,
    Board, Settings,
};
use tracing::{info, warn};

const WATCH_PERIOD: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Load settings")?;

    tracing_subscriber::fmt()
        .with_max_level(settings.log_level()?)
        .init();
    info!("Starting pt-status");

    let watch = match std::env::args().nth(1).as_deref() {
        None => false,
        Some("watch") => true,
        Some(other) => bail!("Unknown command {other:?}, expected nothing or \"watch\""),
    };

    let board = Board::new(settings);
    let mut pitop = Pitop::new(&board);

    print_state(&pitop)?;

    if watch {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = stop.clone();
            ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
                .context("Set ctrl-c")?;
        }

        watch_status(&board, &pitop, &stop);
    }

    pitop.close().log_error("Close pitop");
    info!("pt-status stopped");

    Ok(())
}

fn print_state(pitop: &Pitop) -> anyhow::Result<()> {
    let state = serde_json::to_string_pretty(&pitop.state()).context("Serialize state")?;
    println!("{state}");

    Ok(())
}

fn watch_status(board: &Board, pitop: &Pitop, stop: &AtomicBool) {
    let _buttons = match CaseButtons::new(board) {
        Ok(buttons) => {
            for id in CaseButtonId::ALL {
                buttons
                    .button(id)
                    .when_pressed(move || info!("{id:?} pressed"));
            }
            Some(buttons)
        }
        Err(err) => {
            warn!("Case buttons unavailable: {err:?}");
            None
        }
    };

    while !stop.load(Ordering::Relaxed) {
        match pitop.battery().capacity() {
            Ok(capacity) => {
                info!("Battery at {capacity}%");
                if let Some(miniscreen) = pitop.miniscreen() {
                    miniscreen
                        .display_text(&format!("Battery {capacity}%"), Point::new(0, 0))
                        .log_error("Show battery");
                }
            }
            Err(err) => warn!("Could not read battery: {err:?}"),
        }

        let mut waited = Duration::ZERO;
        while waited < WATCH_PERIOD && !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
            waited += Duration::from_millis(100);
        }
    }
}
