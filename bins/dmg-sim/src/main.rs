use clap::Parser;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dmg_config::{SchedulerType, SharedConfig, SimConfig, toml_config};
use dmg_core::{DmgMcs, debug};
use dmg_mac::Network;

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> SharedConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

/// Command line values take precedence over the file
fn apply_overrides(base: &SimConfig, args: &Args) -> Result<SharedConfig, String> {
    let mut cfg = base.clone();
    if let Some(idx) = args.scheduler {
        let (scheduler_type, period) = SchedulerType::from_index(idx);
        cfg.scheduler.scheduler_type = scheduler_type;
        cfg.scenario.allocation_period = period;
    }
    if let Some(idx) = args.mcs {
        cfg.phy.mcs = DmgMcs::from_index(idx).map_err(|e| format!("Invalid --mcs {}: {:?}", idx, e))?;
    }
    if let Some(t) = args.sim_time {
        cfg.scenario.simulation_time_s = t;
    }
    if let Some(n) = args.stations {
        cfg.scenario.num_stations = n;
    }
    if let Some(rate) = args.app_rate {
        cfg.scenario.app_data_rate_mbps = rate;
    }
    if let Some(dir) = &args.output_dir {
        cfg.scenario.output_dir = dir.clone();
    }
    SharedConfig::try_from_config(cfg)
}

fn write_traces(net: &Network, dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut out = BufWriter::new(File::create(dir.join("results.csv"))?);
    writeln!(out, "SrcNodeId,TxPkts_pkts,TxBytes_B,RxPkts_pkts,RxBytes_B,AvgThroughput_Mbps,AvgDelay_s,AvgJitter_s")?;
    for r in net.results() {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            r.src_node, r.tx_packets, r.tx_bytes, r.rx_packets, r.rx_bytes, r.throughput_mbps, r.avg_delay_s, r.avg_jitter_s
        )?;
    }
    out.flush()?;

    let mut out = BufWriter::new(File::create(dir.join("packetsTrace.csv"))?);
    writeln!(out, "SrcNodeId,TxTimestamp_ns,RxTimestamp_ns,PktSize_B")?;
    for p in net.packet_trace() {
        writeln!(out, "{},{},{},{}", p.src_node, p.tx_ns, p.rx_ns, p.size)?;
    }
    out.flush()?;

    let mut out = BufWriter::new(File::create(dir.join("spTrace.csv"))?);
    writeln!(out, "SrcNodeId,Timestamp_ns,isStart")?;
    for a in net.access_trace() {
        writeln!(out, "{},{},{}", a.node, a.ts_ns, a.is_start as u8)?;
    }
    out.flush()
}

fn print_summary(net: &Network, cfg: &SharedConfig) {
    let results = net.results();
    let total_mbps: f64 = results.iter().map(|r| r.throughput_mbps).sum();
    let state = cfg.state_read();

    eprintln!("\n -> {} stations, {} scheduler, {}", results.len(), net.ap().scheduler().policy_name(), cfg.config().phy.mcs);
    for r in &results {
        eprintln!(
            "    node {:>3}: {:>7} / {:>7} packets, {:>9.2} Mbps, delay {:.6} s, jitter {:.6} s",
            r.src_node, r.rx_packets, r.tx_packets, r.throughput_mbps, r.avg_delay_s, r.avg_jitter_s
        );
    }
    eprintln!(" -> total throughput {:.2} Mbps", total_mbps);
    eprintln!(
        " -> ADDTS accepted {} rejected {}, {} MPDUs sent, {} failed, {} MSDUs dropped",
        state.addts_accepted, state.addts_rejected, state.tx_mpdus, state.tx_failed_mpdus, state.dropped_msdus
    );
    eprintln!(
        " -> {} transmissions suspended at allocation end, {} resumed",
        state.suspended_transmissions, state.resumed_transmissions
    );
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "IEEE 802.11ad DMG MAC simulator",
    long_about = "Simulates one DMG BSS whose stations stream CBR traffic to the AP under the selected access scheduler"
)]
struct Args {
    /// Config file; built-in defaults when omitted
    #[arg(help = "TOML config with scheduler/phy/mac/scenario parameters")]
    config: Option<String>,

    /// 0: CBAP only, 1: Basic, n > 1: Periodic with n SPs per beacon interval
    #[arg(long)]
    scheduler: Option<u8>,

    #[arg(long, help = "DMG MCS index used for data frames")]
    mcs: Option<u8>,

    #[arg(long = "sim-time", help = "Simulated time in seconds")]
    sim_time: Option<f64>,

    #[arg(long)]
    stations: Option<u16>,

    #[arg(long = "app-rate", help = "Offered load per station in Mbps")]
    app_rate: Option<f64>,

    #[arg(long = "output-dir")]
    output_dir: Option<String>,
}

fn main() {
    let args = Args::parse();
    let base = match &args.config {
        Some(path) => load_config_from_toml(path).config(),
        None => Arc::new(SimConfig::default()),
    };
    let cfg = match apply_overrides(&base, &args) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}", e);
            std::process::exit(1);
        }
    };
    let _log_guard = debug::setup_logging_default(cfg.config().debug_log.clone());

    // Set up Ctrl+C handler, the run stops at the next event
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!("no Ctrl+C handler, the run can only end at its configured time: {}", e);
    }

    let mut net = Network::new(cfg.clone());
    if let Err(e) = net.start() {
        println!("Cannot build the service period requests: {}", e);
        std::process::exit(1);
    }
    net.run(Some(running));

    let dir = cfg.config().scenario.output_dir.clone();
    if let Err(e) = write_traces(&net, Path::new(&dir)) {
        tracing::error!("failed to write traces to {}: {}", dir, e);
    }
    print_summary(&net, &cfg);
}
