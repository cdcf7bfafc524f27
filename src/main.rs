use std::env::set_var;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use log::*;
use rkv::{Cursor, Locate, OpenOpts, Store, OF_RDONLY};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([file] "Store file path").default_value("rkv.db"))
        .arg(
            arg!(-d --db <ID> "Database id inside the store")
                .required(false)
                .default_value("1"),
        )
        .arg(arg!(--put <KV> "Put one record, key and value").num_args(2).required(false))
        .arg(arg!(--get <K> "Print the value stored under a key").required(false))
        .arg(arg!(--del <K> "Delete one record").required(false))
        .arg(arg!(--scan "List all records in key order").action(ArgAction::SetTrue))
        .arg(arg!(--stat "Print store statistics").action(ArgAction::SetTrue))
        .arg(arg!(-r --read_only "Open the store read-only").action(ArgAction::SetTrue))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    rkv::init();

    let file = matches.get_one::<String>("file").unwrap();
    let dbid: u32 = matches
        .get_one::<String>("db")
        .unwrap()
        .parse()
        .map_err(|_| anyhow!("--db takes a numeric database id"))?;
    let oflags = if matches.get_flag("read_only") { OF_RDONLY } else { 0 };
    info!("store file: {}", file);

    let store = Store::open(file, OpenOpts { oflags, ..Default::default() })?;
    let db = store.db(dbid, 0)?;

    if let Some(mut kv) = matches.get_many::<String>("put") {
        let key = kv.next().unwrap();
        let val = kv.next().unwrap();
        db.put(key.as_bytes(), val.as_bytes())?;
        println!("put {} = {}", key, val);
    } else if let Some(key) = matches.get_one::<String>("get") {
        let val = db.get(key.as_bytes())?;
        println!("{}", String::from_utf8_lossy(&val));
    } else if let Some(key) = matches.get_one::<String>("del") {
        db.del(key.as_bytes())?;
        println!("deleted {}", key);
    } else if matches.get_flag("scan") {
        let cur: Cursor = db.cursor(Locate::First)?;
        let mut n = 0usize;
        while cur.next().is_ok() {
            let (key, val) = cur.pair()?;
            println!(
                "{}\t{}",
                String::from_utf8_lossy(&key),
                String::from_utf8_lossy(&val)
            );
            n += 1;
        }
        println!("{} records", n);
    } else if matches.get_flag("stat") {
        let st = store.state();
        println!("file size: {} bytes", st.file_size);
        println!("page size: {}", st.page_size);
        println!("mmap slots: {}", st.slots.len());
        println!("db {} last access: {} ms", dbid, db.last_access_ms());
    }

    store.close()?;
    Ok(())
}
