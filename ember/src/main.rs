use clap::Parser as ClapParser;
use clap::Subcommand;
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    process,
};

use ember::{
    GarbageCollector, GcCreateInfo, ImageRegistry, ManagedMemory, RealAddr,
    collector::{CollectionOutcome, CollectionRequest, CollectionRoutine, VM_OPTIONS_HELP},
    serializer::{LoadedImage, read_header},
};
use log::warn;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header of an image file
    Inspect {
        #[arg(help = "The image file to read")]
        image: PathBuf,
    },
    /// Load a chain of images, parents first, and run one collection over them
    #[command(after_help = VM_OPTIONS_HELP)]
    Load {
        /// Image files, bootstrap first. `PATH=URI` registers the image
        /// under URI, which is what its children name as their parent;
        /// a bare PATH is registered as `file://PATH`.
        #[arg(required = true, value_parser = parse_image)]
        images: Vec<ImageArg>,

        /// Real address the first image is placed at
        #[arg(long, default_value = "0x10000000", value_parser = parse_addr)]
        base: u64,

        /// VM options, passed after `--`
        #[arg(last = true)]
        vm_options: Vec<String>,
    },
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad address `{s}`: {e}"))
}

#[derive(Debug, Clone)]
struct ImageArg {
    path: PathBuf,
    uri: String,
}

fn parse_image(s: &str) -> Result<ImageArg, String> {
    let (path, uri) = match s.split_once('=') {
        Some((_, "")) => return Err(format!("empty uri in `{s}`")),
        Some((path, uri)) => (PathBuf::from(path), uri.to_string()),
        None => (PathBuf::from(s), format!("file://{s}")),
    };
    Ok(ImageArg { path, uri })
}

/// Resident images seen as one heap.
struct ResidentImages(Vec<LoadedImage>);

impl ManagedMemory for ResidentImages {
    fn free_memory(&self) -> u64 {
        0
    }

    fn total_allocated(&self) -> u64 {
        self.0.iter().map(|i| i.image.size() as u64).sum()
    }
}

/// Visits every word of every image without moving anything.
struct ScanOnly;

impl CollectionRoutine<ResidentImages> for ScanOnly {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn collect(
        &mut self,
        memory: &mut ResidentImages,
        _request: CollectionRequest<'_>,
    ) -> CollectionOutcome {
        CollectionOutcome {
            full: true,
            bytes_scanned: memory.0.iter().map(|i| i.memory.len() as u64).sum(),
        }
    }
}

fn inspect(path: &Path) -> ember::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader)?;
    let format = header.format();
    println!("== {} ==", path.display());
    println!("version      {}.{}", header.major_version, header.minor_version);
    println!("attributes   {:?}", header.attributes);
    println!("word size    {} bytes, {:?} endian", format.word.bytes(), format.byte_order);
    if header.has_parent() {
        println!("parent       {} ({:#010x})", header.parent_uri, header.parent_hash);
    } else {
        println!("parent       <none>");
    }
    println!("size         {} bytes ({} words)", header.size, header.words());
    println!("root offset  {:#x}", header.root_offset);
    let pointers: u32 = header.oop_map.iter().map(|b| b.count_ones()).sum();
    println!("pointers     {pointers}");
    Ok(())
}

fn load(images: &[ImageArg], base: u64, vm_options: &[String]) -> ember::Result<()> {
    let registry = ImageRegistry::new();
    let mut resident = Vec::new();
    let mut place_at = RealAddr::new(base);
    for ImageArg { path, uri } in images {
        let mut reader = BufReader::new(File::open(path)?);
        let loaded = registry.load(&mut reader, uri, place_at)?;
        println!(
            "loaded {} at {} (canonical {}..{})",
            loaded.image.uri(),
            loaded.image.start(),
            loaded.image.canonical_start(),
            loaded.image.canonical_end()
        );
        place_at = loaded.image.end().add(0xFFF);
        place_at = RealAddr::new(place_at.raw() & !0xFFF);
        resident.push(loaded);
    }

    let mut gc: GarbageCollector<ResidentImages> =
        GarbageCollector::new(GcCreateInfo::default(), Box::new(ScanOnly), None);
    for option in vm_options {
        if !gc.process_option(option) {
            warn!("unrecognised VM option {option}");
        }
    }
    let mut heap = ResidentImages(resident);
    gc.collect(&mut heap, place_at, true);
    let stats = gc.stats();
    println!(
        "collected with {:?}: {} bytes scanned in {} {:?}",
        gc.backend(),
        stats.last_bytes_scanned,
        stats.last_collection_time,
        gc.settings().timer
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Inspect { image } => inspect(image),
        Command::Load {
            images,
            base,
            vm_options,
        } => load(images, *base, vm_options),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_arguments_take_an_optional_uri() {
        let bare = parse_image("boot.img").unwrap();
        assert_eq!(bare.path, PathBuf::from("boot.img"));
        assert_eq!(bare.uri, "file://boot.img");

        let named = parse_image("boot.img=memory:bootstrap").unwrap();
        assert_eq!(named.path, PathBuf::from("boot.img"));
        assert_eq!(named.uri, ember::BOOTSTRAP_URI);

        assert!(parse_image("boot.img=").is_err());
    }

    #[test]
    fn addresses_parse_as_hex_or_decimal() {
        assert_eq!(parse_addr("0x1000"), Ok(0x1000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xZZ").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
