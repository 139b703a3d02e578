// This build script exports build metadata consumed by src/version.rs.
// Values can be overridden by the release pipeline through the environment.
fn main() -> Result<(), anyhow::Error> {
    let rustc = rustc_version::version()?;
    println!("cargo:rustc-env=CERT_EXPORTER_BUILD_RUSTC_VERSION={rustc}");

    for (key, default) in [
        ("buildVersion", env!("CARGO_PKG_VERSION")),
        ("buildGitRevision", "unknown"),
        ("buildStatus", "unknown"),
        ("buildTag", "unknown"),
    ] {
        let var = format!("CERT_EXPORTER_BUILD_{key}");
        let value = std::env::var(&var).unwrap_or_else(|_| default.to_string());
        println!("cargo:rustc-env={var}={value}");
        println!("cargo:rerun-if-env-changed={var}");
    }

    Ok(())
}
