use clap::Parser;
use std::path::PathBuf;

use crate::roster::ImageFormat;

#[derive(Parser, Debug, Default)]
#[command(
    name = "badge-processor",
    version,
    about = "Batch ID badge generator",
    long_about = "
Badge Processor

Builds identity badges for a roster of people. Source portraits are named
<name>_<id>_<role>_<seq>.<ext>; any portrait missing from the source directory
is downloaded from the remote image server before composition. Each badge gets
the face-cropped portrait, text fields and a QR code placed on a template.",
    after_help = "EXAMPLES:
  # Everything from a config file
  badge-processor --config badges.json

  # Roster from a JSON file, download missing portraits with 8 workers
  badge-processor -c badges.json --roster staff.json --base-url https://img.example.com/staff -w 8

  # Use only local portraits, print a result table
  badge-processor -c badges.json --no-download --report

  # Minimal run without a config file
  badge-processor -s ./photos -o ./badges --template card.png --portrait-slot 40,60,300x380

  # Inspect a filename
  badge-processor --decode-filename john_T001_SE_1.jpg"
)]
pub struct Args {
    /// JSON configuration file; command-line flags override its values
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Roster file: JSON array of entries or one canonical filename per line.
    /// Without it every decodable image in the source directory is used.
    #[arg(short = 'r', long = "roster", value_name = "FILE")]
    pub roster: Option<PathBuf>,

    /// Directory holding (and receiving) source portraits
    #[arg(short = 's', long = "source", value_name = "DIR")]
    pub source_dir: Option<PathBuf>,

    /// Directory for finished badges
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Extension of source portraits and of remote image URLs
    #[arg(long = "source-format", value_name = "EXT")]
    pub source_format: Option<ImageFormat>,

    /// Badge image format (png, jpg, bmp, webp)
    #[arg(long = "output-format", value_name = "EXT")]
    pub output_format: Option<ImageFormat>,

    /// Prefix of badge filenames
    #[arg(long = "prefix", value_name = "TEXT")]
    pub output_prefix: Option<String>,

    /// Badge template image
    #[arg(short = 't', long = "template", value_name = "FILE")]
    pub template: Option<PathBuf>,

    /// Portrait slot on the template (format: X,Y,WIDTHxHEIGHT)
    #[arg(long = "portrait-slot", value_name = "X,Y,WxH")]
    pub portrait_slot: Option<String>,

    /// Font file (path or file name found in system font directories)
    #[arg(long = "font", value_name = "FONT")]
    pub font: Option<PathBuf>,

    /// Base font size for text fields
    #[arg(long = "font-size", value_name = "SIZE")]
    pub font_size: Option<f32>,

    /// QR payload template, e.g. "https://intra.example.com/staff/{employee_id}"
    #[arg(long = "qr-text", value_name = "TEMPLATE")]
    pub qr_text: Option<String>,

    /// Remote image server; portraits are fetched from <URL>/<id>.<ext>
    #[arg(long = "base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Number of concurrent downloads
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Per-download timeout in seconds
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Never contact the remote image server
    #[arg(long = "no-download")]
    pub no_download: bool,

    /// OpenCV Haar cascade XML (e.g. haarcascade_frontalface_default.xml); without it every badge uses the whole photo
    #[arg(long = "cascade", value_name = "FILE")]
    pub cascade: Option<PathBuf>,

    /// Print a table with every badge result
    #[arg(long = "report")]
    pub report: bool,

    /// Write the full batch report as JSON
    #[arg(long = "report-json", value_name = "FILE")]
    pub report_json: Option<PathBuf>,

    /// Decode a canonical filename, print its fields and exit
    #[arg(long = "decode-filename", value_name = "NAME")]
    pub decode_filename: Option<String>,

    /// Emit progress as JSON lines on stdout (for GUI front ends)
    #[arg(long = "json-progress")]
    pub json_progress: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Parse `X,Y,WIDTHxHEIGHT`
pub fn parse_slot(slot: &str) -> anyhow::Result<(i64, i64, u32, u32)> {
    let parts: Vec<&str> = slot.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        anyhow::bail!("Invalid slot format '{}'. Expected X,Y,WIDTHxHEIGHT", slot);
    }

    let x = parts[0]
        .parse::<i64>()
        .map_err(|_| anyhow::anyhow!("Invalid slot x '{}'", parts[0]))?;
    let y = parts[1]
        .parse::<i64>()
        .map_err(|_| anyhow::anyhow!("Invalid slot y '{}'", parts[1]))?;
    let (width, height) = parse_size(parts[2])?;
    Ok((x, y, width, height))
}

/// Parse `WIDTHxHEIGHT`
pub fn parse_size(size: &str) -> anyhow::Result<(u32, u32)> {
    let parts: Vec<&str> = size.split('x').collect();
    if parts.len() != 2 {
        anyhow::bail!("Invalid size format '{}'. Expected WIDTHxHEIGHT", size);
    }

    let width = parts[0]
        .parse::<u32>()
        .map_err(|_| anyhow::anyhow!("Invalid width '{}'", parts[0]))?;
    let height = parts[1]
        .parse::<u32>()
        .map_err(|_| anyhow::anyhow!("Invalid height '{}'", parts[1]))?;

    if width == 0 || height == 0 {
        anyhow::bail!("Width and height must be greater than 0");
    }

    Ok((width, height))
}
