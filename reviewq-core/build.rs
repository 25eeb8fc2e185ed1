fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through REVIEWQ_GIT_HASH from release build environments
    println!("cargo:rerun-if-env-changed=REVIEWQ_GIT_HASH");
    if let Ok(hash) = std::env::var("REVIEWQ_GIT_HASH") {
        println!("cargo:rustc-env=REVIEWQ_GIT_HASH={}", hash);
    }
}
