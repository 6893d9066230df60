use std::fs::{self, File};
use std::io::{self, prelude::*, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::*;
use structopt::*;

use zipmend::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "zipmend", about = "Lists, adds to, removes from, and extracts .zip files")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    #[structopt(name("ZIP file"))]
    zip_path: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Prints each entry in the archive.
    List,

    /// Adds files (and directories, recursively), creating the archive if needed.
    Add {
        /// Store files as-is instead of deflating them.
        #[structopt(short = "0", long)]
        store: bool,

        #[structopt(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Removes entries by their path in the archive.
    Remove {
        #[structopt(required = true)]
        paths: Vec<String>,
    },

    /// Dumps the archive into a directory.
    Extract {
        /// Where to extract to
        #[structopt(short = "C", long, default_value = ".")]
        directory: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    match args.command {
        Command::List => list(&args.zip_path),
        Command::Add { store, paths } => add(&args.zip_path, store, &paths),
        Command::Remove { paths } => remove(&args.zip_path, &paths),
        Command::Extract { directory } => extract(&args.zip_path, &directory),
    }
}

fn open(zip_path: &Path, mode: AccessMode) -> Result<Archive<FileStore>> {
    Archive::open(zip_path, mode)
        .with_context(|| format!("Couldn't open {}", zip_path.display()))
}

fn list(zip_path: &Path) -> Result<()> {
    let mut archive = open(zip_path, AccessMode::Read)?;
    for entry in archive.entries() {
        println!(
            "{:>10} {:>10} {} {}",
            entry.uncompressed_size(),
            entry.compressed_size(),
            entry.last_modified().format("%Y-%m-%d %H:%M"),
            entry.path()
        );
    }
    Ok(())
}

fn add(zip_path: &Path, store: bool, paths: &[PathBuf]) -> Result<()> {
    let mode = if zip_path.exists() {
        AccessMode::Update
    } else {
        AccessMode::Create
    };
    let mut archive = open(zip_path, mode)?;
    let method = if store {
        CompressionMethod::None
    } else {
        CompressionMethod::Deflate
    };
    for path in paths {
        add_path(&mut archive, path, method)?;
    }
    Ok(())
}

fn add_path(archive: &mut Archive<FileStore>, path: &Path, method: CompressionMethod) -> Result<()> {
    let name = path
        .to_str()
        .with_context(|| format!("{} isn't valid UTF-8", path.display()))?
        .trim_start_matches('/');
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("Couldn't stat {}", path.display()))?;
    let mut options = FileOptions::default().compression_method(method);
    if let Some(modified) = metadata
        .modified()
        .ok()
        .map(|m| chrono::DateTime::<chrono::Local>::from(m).naive_local())
    {
        options = options.last_modified(modified);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.permissions((metadata.permissions().mode() & 0o7777) as u16);
    }

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        let target = target
            .to_str()
            .with_context(|| format!("{} doesn't point to a UTF-8 path", path.display()))?;
        info!("{} -> {}", name, target);
        archive.add_entry(
            name,
            EntryType::Symlink,
            target.len() as u64,
            &options,
            slice_provider(target.as_bytes()),
        )?;
    } else if file_type.is_dir() {
        info!("{}/", name);
        archive.add_entry(name, EntryType::Directory, 0, &options, slice_provider(b""))?;
        let mut children = fs::read_dir(path)?
            .map(|child| child.map(|c| c.path()))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort();
        for child in children {
            add_path(archive, &child, method)?;
        }
    } else {
        info!("{}", name);
        let mut file = File::open(path)?;
        archive
            .add_entry(name, EntryType::File, metadata.len(), &options, |position, len| {
                file.seek(SeekFrom::Start(position))?;
                let mut chunk = Vec::with_capacity(len);
                (&mut file).take(len as u64).read_to_end(&mut chunk)?;
                Ok(chunk)
            })
            .with_context(|| format!("Couldn't add {}", path.display()))?;
    }
    Ok(())
}

fn remove(zip_path: &Path, paths: &[String]) -> Result<()> {
    let mut archive = open(zip_path, AccessMode::Update)?;
    for path in paths {
        let entry = archive
            .entry(path)
            .with_context(|| format!("No {} in {}", path, zip_path.display()))?;
        info!("Removing {}", path);
        archive.remove(&entry, &TransferOptions::default())?;
    }
    Ok(())
}

fn extract(zip_path: &Path, directory: &Path) -> Result<()> {
    let mut archive = open(zip_path, AccessMode::Read)?;
    // Symlinks go last, so we never write through one we just made.
    for entry in archive.sorted_entries()? {
        let relative = match entry.enclosed_path() {
            Some(p) => p,
            None => {
                warn!("Skipping {}, which would land outside {}", entry.path(), directory.display());
                continue;
            }
        };
        let destination = directory.join(relative.as_std_path());
        info!("{}", destination.display());
        match entry.entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&destination)
                    .with_context(|| format!("Couldn't create directory {}", destination.display()))?;
            }
            EntryType::File => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Couldn't create directory {}", parent.display()))?;
                }
                let mut sink = File::create(&destination)
                    .with_context(|| format!("Couldn't create file {}", destination.display()))?;
                io::copy(&mut archive.reader(&entry)?, &mut sink)?;
            }
            EntryType::Symlink => {
                let target = archive.symlink_target(&entry)?;
                make_symlink(&target, &destination)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Couldn't link {} to {}", link.display(), target))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, link: &Path) -> Result<()> {
    warn!("Not creating symbolic link {} -> {}", link.display(), target);
    Ok(())
}
