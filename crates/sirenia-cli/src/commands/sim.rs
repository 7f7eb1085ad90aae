//! `sirenia sim`: an interactive simulator session on stdin.

use anyhow::Result;
use sirenia_state::simulator::Simulator;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(singleton: bool) -> Result<()> {
    let mut sim = Simulator::new(singleton);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match sim.run_command(line).await {
            Ok(output) if output.is_empty() => {}
            Ok(output) => println!("{output}"),
            Err(e) => eprintln!("error: {e}"),
        }
        if sim.exited() {
            break;
        }
    }

    sim.close();
    Ok(())
}
