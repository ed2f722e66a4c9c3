// build.rs
// Compiles the GLSL compute kernels under shaders/ into SPIR-V

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping kernel compilation (SKIP_SHADERS set)");
        return;
    }

    // Check for Vulkan SDK
    let Ok(vulkan_sdk) = env::var("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, kernel compilation skipped");
        eprintln!("hint: Install Vulkan SDK and set VULKAN_SDK environment variable");
        return;
    };

    let glslc = if cfg!(target_os = "windows") {
        format!("{vulkan_sdk}\\Bin\\glslc.exe")
    } else {
        format!("{vulkan_sdk}/bin/glslc")
    };

    if !Path::new(&glslc).exists() {
        eprintln!("error: glslc not found at: {glslc}");
        eprintln!("hint: Ensure Vulkan SDK is properly installed");
        panic!("Shader compiler not found");
    }

    let shader_dir = PathBuf::from("shaders");
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("cargo sets OUT_DIR")).join("shaders");

    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        eprintln!("warning: Failed to create kernel output directory: {e}");
        return;
    }

    let Ok(entries) = std::fs::read_dir(&shader_dir) else {
        eprintln!("info: No shader directory found at: {shader_dir:?}");
        return;
    };

    let mut compiled_count = 0;
    for entry in entries {
        let path = match entry {
            Ok(e) => e.path(),
            Err(e) => {
                eprintln!("warning: Error reading shader directory entry: {e}");
                continue;
            }
        };

        if path.extension().map_or(true, |ext| ext != "comp") {
            continue;
        }

        let Some(file_name) = path.file_name() else {
            continue;
        };
        let out_file = out_dir.join(file_name).with_extension("comp.spv");

        let status = Command::new(&glslc)
            .arg("--target-env=vulkan1.2")
            .arg(&path)
            .arg("-o")
            .arg(&out_file)
            .status();

        match status {
            Ok(s) if s.success() => {
                eprintln!("info: Compiled {:?} -> {:?}", path.file_name(), out_file.file_name());
                compiled_count += 1;
            }
            Ok(s) => {
                eprintln!("error: glslc failed for {:?} with exit code: {}", path, s.code().unwrap_or(-1));
                panic!("Kernel compilation failed");
            }
            Err(e) => {
                eprintln!("error: Failed to run glslc for {path:?}: {e}");
                panic!("Failed to execute shader compiler");
            }
        }
    }

    if compiled_count > 0 {
        eprintln!("info: Successfully compiled {compiled_count} kernel(s)");
        println!("cargo:rustc-env=RAYTRACER_KERNEL_DIR={}", out_dir.display());
    }
}
