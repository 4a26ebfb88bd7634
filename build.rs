//! Locates FFmpeg ahead of `ffmpeg-sys-next` and, on Windows, puts the
//! shared libraries next to the binary. Only ever warns.

use std::env;
use std::path::{Path, PathBuf};

/// Runtime FFmpeg libraries, without the `lib` prefix
const FFMPEG_LIBRARIES: [&str; 5] = ["avcodec", "avformat", "avutil", "swscale", "swresample"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    match detect_ffmpeg() {
        Some(FfmpegLocation::PkgConfig) => {}
        Some(FfmpegLocation::Directory(dir)) => {
            if target_os == "windows" {
                if let Err(e) = copy_ffmpeg_dlls(&dir) {
                    println!("cargo:warning=Failed to copy FFmpeg DLLs: {}", e);
                }
            }
        }
        None => print_install_hint(&target_os),
    }
}

enum FfmpegLocation {
    PkgConfig,
    Directory(PathBuf),
}

/// Find FFmpeg via pkg-config first, then `FFMPEG_DIR`
fn detect_ffmpeg() -> Option<FfmpegLocation> {
    let all_found = FFMPEG_LIBRARIES.iter().all(|lib| {
        pkg_config::Config::new()
            .cargo_metadata(false)
            .probe(&format!("lib{}", lib))
            .is_ok()
    });
    if all_found {
        return Some(FfmpegLocation::PkgConfig);
    }

    let dir = PathBuf::from(env::var("FFMPEG_DIR").ok()?);
    if dir.join("lib").exists() {
        Some(FfmpegLocation::Directory(dir))
    } else {
        println!(
            "cargo:warning=FFMPEG_DIR={} has no lib directory",
            dir.display()
        );
        None
    }
}

fn print_install_hint(target_os: &str) {
    println!("cargo:warning=System FFmpeg libraries not found; relying on ffmpeg-sys-next");
    match target_os {
        "windows" => {
            println!("cargo:warning=  Download a shared build and set FFMPEG_DIR to its root");
        }
        "macos" => {
            println!("cargo:warning=  Run: brew install ffmpeg");
        }
        "linux" => {
            println!("cargo:warning=  Ubuntu/Debian: sudo apt install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev libswresample-dev");
        }
        _ => {}
    }
}

/// Copies `<FFMPEG_DIR>/bin/<lib>-*.dll` into the profile directory
fn copy_ffmpeg_dlls(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let bin = root.join("bin");
    if !bin.exists() {
        return Ok(());
    }

    // OUT_DIR is target/<profile>/build/<pkg>-<hash>/out
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let profile_dir = out_dir.ancestors().nth(3).ok_or("unexpected OUT_DIR layout")?;

    for lib in FFMPEG_LIBRARIES {
        let pattern = bin.join(format!("{}-*.dll", lib));
        for dll in glob::glob(&pattern.to_string_lossy())?.flatten() {
            if let Some(name) = dll.file_name() {
                let dest = profile_dir.join(name);
                if !dest.exists() {
                    std::fs::copy(&dll, dest)?;
                }
            }
        }
    }
    Ok(())
}
