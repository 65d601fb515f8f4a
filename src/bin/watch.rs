//! Arms one watchpoint on this process, touches the watched memory and reports
//! how often the trap handler fired.

use anyhow::{Context, Result};
use clap::{crate_version, App, Arg};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fugue_watch::{Breakpoint, Config, Kind, Size, Spec, Word};

static HITS: AtomicUsize = AtomicUsize::new(0);
static LAST: AtomicUsize = AtomicUsize::new(0);

fn on_hit(address: Word) {
    HITS.fetch_add(1, Ordering::SeqCst);
    LAST.store(address as usize, Ordering::SeqCst);
}

#[inline(never)]
fn bump(cell: &mut u64) {
    unsafe { ptr::write_volatile(cell, ptr::read_volatile(cell).wrapping_add(1)) }
}

fn main() -> Result<()> {
    let matches = App::new("fugue-watch")
        .version(crate_version!())
        .about("Trap on access to a heap buffer using a hardware watchpoint")
        .arg(
            Arg::with_name("kind")
                .long("kind")
                .takes_value(true)
                .possible_values(&["execute", "write", "access"])
                .default_value("write"),
        )
        .arg(
            Arg::with_name("size")
                .long("size")
                .takes_value(true)
                .possible_values(&["1", "2", "4", "8"])
                .default_value("8"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .value_name("TOML"),
        )
        .get_matches();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("fugue_watch=info".parse()?))
        .init();

    let config = match matches.value_of("config") {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };

    let kind = matches.value_of("kind").unwrap_or("write").parse::<Kind>()?;
    let size = matches
        .value_of("size")
        .unwrap_or("8")
        .parse::<usize>()
        .context("parsing --size")?;

    let mut buffer = vec![0u64; 4].into_boxed_slice();
    let entry: fn(&mut u64) = bump;

    let address = match kind {
        Kind::Execute => entry as usize as Word,
        _ => &buffer[1] as *const u64 as Word,
    };

    let spec = Spec::new(kind, address, Size::from_bytes(size)?)?;
    let editor = config.editor().context("selecting register editor")?;

    fugue_watch::set_breakpoint_handler(Some(on_hit)).context("installing trap handler")?;

    let mut bp = Breakpoint::new(spec, editor);
    let slot = bp
        .attach()
        .with_context(|| format!("arming {} watchpoint at {:#x}", kind, address))?;

    info!(%slot, "watching {:#x} ({}, {} bytes)", address, kind, size);

    let seen = unsafe { ptr::read_volatile(&buffer[1]) };
    let call = unsafe { ptr::read_volatile(&entry) };
    call(&mut buffer[1]);

    bp.detach().context("disarming watchpoint")?;
    fugue_watch::set_breakpoint_handler(None)?;

    let hits = HITS.load(Ordering::SeqCst);
    info!(hits, "read {} then wrote {}", seen, buffer[1]);

    if hits > 0 {
        println!("{} hit(s); last at {:#x}", hits, LAST.load(Ordering::SeqCst));
    } else {
        println!("no hits");
    }

    Ok(())
}
