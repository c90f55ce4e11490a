//! Build script for tabserv
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `tabserv --version`.

fn main() {
    // Re-run build if the default iptables location changes
    println!("cargo:rerun-if-env-changed=TABSERV_SYSTEM_IPTABLES_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
