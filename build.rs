// Compiles the GLSL sources under shaders/ to SPIR-V next to them

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/quad.vert", "shaders/quad.frag"];

fn main() {
    for source in SHADERS {
        println!("cargo:rerun-if-changed={source}");
        let spirv = format!("{source}.spv");

        match Command::new("glslc").arg(source).arg("-o").arg(&spirv).status() {
            Ok(status) if status.success() => {}
            Ok(status) => panic!("glslc rejected {source} ({status})"),
            Err(e) if Path::new(&spirv).exists() => {
                println!("cargo:warning=glslc unavailable ({e}), keeping existing {spirv}");
            }
            Err(e) => {
                println!("cargo:warning=glslc unavailable ({e}), run: glslc {source} -o {spirv}");
            }
        }
    }
}
