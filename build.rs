//! Build script for vpnfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! and lets packagers override the default tool names.

fn main() {
    // Re-run build if these environment variables change
    println!("cargo:rerun-if-env-changed=VPNFW_SYSTEM_IPTABLES_PATH");
    println!("cargo:rerun-if-env-changed=VPNFW_SYSTEM_IP6TABLES_PATH");
    println!("cargo:rerun-if-env-changed=VPNFW_SYSTEM_IPSET_PATH");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
