//! Command line front end over a blocfs disk file.
//!
//! ```text
//! cargo run --example blocfs -- init
//! cargo run --example blocfs -- put notes.txt /notes.txt
//! cargo run --example blocfs -- ls /
//! RUST_LOG=debug cargo run --example blocfs -- dump
//! ```

use std::path::PathBuf;

use blocfs::{FileSystem, FileType, FsError, FsResult, Inode, DISK};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Inspect and edit a blocfs disk file")]
struct Cli {
    /// Disk file to operate on
    #[arg(long, short, default_value = DISK)]
    disk: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Erase the disk and write an empty root directory
    Init,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file
    Cat { path: String },
    /// Copy a host file onto the disk
    Put { source: PathBuf, path: String },
    Mkdir { path: String },
    /// Remove a file or an empty directory
    Rm { path: String },
    /// Move or rename an entry
    Mv { from: String, to: String },
    /// Print every record in the log as JSON
    Dump,
    /// Print record counts as JSON
    Usage,
}

/// Splits `/a/b/c` into the inode of `/a/b` and `c`.
fn parent_of<'a>(fs: &FileSystem<blocfs::FileDevice>, path: &'a str) -> FsResult<(Inode, &'a str)> {
    let path = path.trim_end_matches('/');
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    };
    Ok((fs.resolve(dir)?, name))
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let fs = FileSystem::at(&cli.disk);

    match cli.command {
        Command::Init => {
            fs.clean()?;
            fs.create_root()?;
            println!("initialised {}", cli.disk.display());
        }
        Command::Ls { path } => {
            let dir = fs.resolve(&path)?;
            for child in fs.children(&dir)? {
                let marker = if child.is_dir() { "/" } else { "" };
                println!("{:>6} {:>8} {}{}", child.id, child.size, child.name, marker);
            }
        }
        Command::Cat { path } => {
            let file = fs.resolve(&path)?;
            print!("{}", String::from_utf8_lossy(&fs.read_to_end(&file)?));
        }
        Command::Put { source, path } => {
            let content = std::fs::read(&source)?;
            let (dir, name) = parent_of(&fs, &path)?;
            let inode = match fs.lookup(&dir, name) {
                Ok(mut inode) => {
                    fs.write(&mut inode, &content)?;
                    inode
                }
                Err(FsError::NotFound) => fs.create_file(&dir, name, &content)?,
                Err(err) => return Err(err.into()),
            };
            log::info!("{} -> inode {} ({} blocs)", source.display(), inode.id, inode.bloc_count());
        }
        Command::Mkdir { path } => {
            let (dir, name) = parent_of(&fs, &path)?;
            fs.create_directory(&dir, name)?;
        }
        Command::Rm { path } => {
            let (dir, name) = parent_of(&fs, &path)?;
            let kind = fs.lookup(&dir, name)?.kind;
            match kind {
                FileType::Directory => fs.remove_empty_directory(&dir, name)?,
                FileType::RegularFile => fs.unlink(&dir, name)?,
            }
        }
        Command::Mv { from, to } => {
            let (src, name) = parent_of(&fs, &from)?;
            let (dst, new_name) = parent_of(&fs, &to)?;
            fs.move_entry(&src, name, &dst, new_name)?;
        }
        Command::Dump => println!("{}", fs.dump_json()?),
        Command::Usage => println!("{}", serde_json::to_string_pretty(&fs.usage()?)?),
    }
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("blocfs: {}", err);
        std::process::exit(1);
    }
}
