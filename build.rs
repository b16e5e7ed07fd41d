use std::{
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

fn main() {
    let built_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    // cli.rs include_str!s this file for the --version string
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    fs::write(out_dir.join("build_timestamp.txt"), built_at.to_string())
        .expect("failed to write build timestamp");

    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");
}
