//! `aqbench` — factory bench-test CLI for the Aquarian board.

use aquarian_bench::{
    BenchConfig, Board, Led, LedColor, PassFailOutcome, SerialTransport, FAIL,
    MIN_FIRMWARE_VERSION,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "aqbench", about = "Aquarian board bench test", version)]
struct Cli {
    /// Station config file.
    #[arg(long, default_value = "bench.toml")]
    config: PathBuf,

    /// Override the DUT console port from the config file.
    #[arg(long)]
    port: Option<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the full board test sequence.
    Board {
        /// Board serial number, written to EEPROM as KA1-NNNNNN.
        sernum: u32,
    },
    /// Poll and report ADC readings.
    Adc,
    /// Poll and report digital flow-counter readings.
    Digi,
    /// Print the board-test firmware version.
    Version,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match BenchConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let port = cli.port.unwrap_or(config.console.port);

    let mut board = match Board::open(&port, config.console.baud) {
        Ok(board) => board,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Every mode talks to the test firmware; gate on its version first.
    let version = match board.require_version(MIN_FIRMWARE_VERSION) {
        Ok(version) => version,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    println!("Test firmware version: {version}");

    let failed = match cli.mode {
        Mode::Board { sernum } => run_board(&mut board, sernum),
        Mode::Adc => run_adc(&mut board),
        Mode::Digi => run_digi(&mut board),
        Mode::Version => false,
    };

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Full production test sequence. Aborts at the first failing step; the
/// transport still closes cleanly on return.
fn run_board(board: &mut Board, sernum: u32) -> bool {
    let failed = board_sequence(board, sernum).is_none();
    println!();
    if failed {
        println!(">>>>> FAIL <<<<<");
    } else {
        println!(">>>>> PASS <<<<<");
    }
    println!();
    failed
}

fn board_sequence(board: &mut Board, sernum: u32) -> Option<()> {
    let cpu_id = board.read_cpu_id()?;
    println!("cpuId: {cpu_id}");

    run_step(board, "EEPROM-TEST")?;

    if !board.set_eeprom_info(sernum, &date_stamp()) {
        println!("Failed to set EEPROM info");
        return None;
    }
    let info = board.read_eeprom_info()?;
    println!("INFO: {info}");

    run_step(board, "IOX-TEST")?;
    run_step(board, "ATCA-TEST")?;

    let atca_sn = board.read_atca_serial()?;
    println!("ATCA SN: {atca_sn}");

    run_step(board, "ADC-TEST")?;

    button_test(board)?;
    led_test(board)?;

    println!("Test done");
    Some(())
}

fn run_step(board: &mut Board, cmd: &str) -> Option<()> {
    let outcome = board.run_test(cmd);
    println!("{cmd}: {outcome:?}");
    match outcome {
        PassFailOutcome::Pass => Some(()),
        PassFailOutcome::Fail | PassFailOutcome::Indeterminate => None,
    }
}

/// Verify the button is released, then wait for the operator to press it.
fn button_test(board: &mut Board) -> Option<()> {
    const WAIT_LIMIT: Duration = Duration::from_secs(60);

    println!("Button test");
    match board.read_button() {
        None => {
            println!("Failed to read button");
            return None;
        }
        Some(true) => {
            println!("  Button is stuck");
            return None;
        }
        Some(false) => {}
    }

    println!("  >>>>> Press the button <<<<<");
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        match board.read_button() {
            None => return None,
            Some(true) => return Some(()),
            Some(false) => {
                if Instant::now() > deadline {
                    println!("  Timed out waiting for button press");
                    return None;
                }
                thread::sleep(Duration::from_millis(250));
            }
        }
    }
}

/// Walk both status LEDs through every color so the operator can eyeball
/// them, ending dark.
fn led_test(board: &mut Board) -> Option<()> {
    println!("LED test");
    for led in [Led::Sys, Led::Ble] {
        for color in [LedColor::Red, LedColor::Green, LedColor::Blue, LedColor::Off] {
            if !board.set_led(led, color) {
                println!("  LED-{}-SET {} failed", led.as_str(), color.as_str());
                return None;
            }
            thread::sleep(Duration::from_millis(250));
        }
    }
    Some(())
}

/// Poll `ADC-READ-ALL` every two seconds and render a channel table.
/// Runs until interrupted.
fn run_adc(board: &mut Board<SerialTransport>) -> bool {
    let mut line_count = 0u32;
    loop {
        match poll_data_line(board, "ADC-READ-ALL") {
            Some(data) => {
                // Firmware 1.20.0 returns JSON:
                // [[ch0_raw, ch0_mv_raw, ch0_cal, ch0_mv_cal], ...]
                match serde_json::from_str::<Vec<[f64; 4]>>(&data) {
                    Ok(channels) if channels.len() >= 6 => {
                        if line_count % 10 == 0 {
                            println!();
                            println!("  PRESS1      PRESS2      PRESS3      PRESS4       TEMP        COND");
                            println!(" RAW   CAL   RAW   CAL   RAW   CAL   RAW   CAL   RAW   CAL   RAW   CAL  ");
                            println!("----  ----  ----  ----  ----  ----  ----  ----  ----  ----  ----  ----");
                        }
                        for channel in channels.iter().take(6) {
                            print!("{:4}  {:4}  ", channel[0], channel[2]);
                        }
                        println!();
                        line_count += 1;
                    }
                    _ => println!("ADC-READ-ALL returned unexpected data: {data}"),
                }
            }
            None => println!("Command execution failed"),
        }
        thread::sleep(Duration::from_secs(2));
    }
}

/// Poll `DIGI-READ-ALL` every two seconds. Runs until interrupted.
fn run_digi(board: &mut Board<SerialTransport>) -> bool {
    let mut line_count = 0u32;
    loop {
        match poll_data_line(board, "DIGI-READ-ALL") {
            Some(data) => match serde_json::from_str::<Vec<i64>>(&data) {
                Ok(counts) if counts.len() >= 3 => {
                    if line_count % 10 == 0 {
                        println!();
                        println!("   FLOW1     FLOW2     FLOW3");
                        println!("--------  --------  --------");
                    }
                    println!("{:8}  {:8}  {:8}", counts[0], counts[1], counts[2]);
                    line_count += 1;
                }
                _ => println!("DIGI-READ-ALL returned unexpected data: {data}"),
            },
            None => println!("Command execution failed"),
        }
        thread::sleep(Duration::from_secs(2));
    }
}

/// One polling exchange: send the command and return the data line above
/// the trailing `OK`, or `None` on any failure.
fn poll_data_line(board: &mut Board<SerialTransport>, cmd: &str) -> Option<String> {
    let resp = board.console().send(cmd, Duration::from_secs(2));
    if resp == FAIL {
        return None;
    }
    let lines: Vec<&str> = resp.split("\r\n").collect();
    match lines[..] {
        [.., data, "OK"] => Some(data.to_string()),
        _ => None,
    }
}

/// Today's date as `YYYY-MM-DD` for the EEPROM date stamp.
fn date_stamp() -> String {
    let now = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}
