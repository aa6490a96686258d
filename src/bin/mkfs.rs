// mkfs: format a file system image, optionally copying files into its
// root directory.

use oxfs::{mkfs, FileDisk, IType, Path, DIRSIZ};
use std::env;
use std::path::Path as HostPath;
use std::process;
use std::sync::Arc;

const FSSIZE: u32 = 2000;
const NINODES: u32 = 200;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: mkfs fs.img [files...]");
        process::exit(1);
    }

    let disk = FileDisk::create(&args[1], FSSIZE)
        .unwrap_or_else(|e| die(&format!("{}: {}", args[1], e)));
    let fs = mkfs::format(Arc::new(disk), FSSIZE, NINODES);

    for arg in &args[2..] {
        let host = HostPath::new(arg);
        let data = std::fs::read(host).unwrap_or_else(|e| die(&format!("{}: {}", arg, e)));

        // Skip a leading _ in the name when writing to the file system,
        // so staging copies like _cat land as cat.
        let shortname = host
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| die(&format!("{}: bad file name", arg)))
            .trim_start_matches('_');
        if shortname.len() > DIRSIZ {
            die(&format!("{}: name longer than {} bytes", shortname, DIRSIZ));
        }

        let path = format!("/{}", shortname);
        fs.begin_op();
        let ip = fs
            .create(Path::new(&path), IType::File, 0, 0)
            .unwrap_or_else(|e| die(&format!("{}: {}", path, e)));
        fs.end_op();

        fs.write_at(&ip, &data, 0)
            .unwrap_or_else(|e| die(&format!("{}: {}", path, e)));

        fs.begin_op();
        fs.iput(ip);
        fs.end_op();

        println!("mkfs: {} -> {} ({} bytes)", arg, path, data.len());
    }
}

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}
