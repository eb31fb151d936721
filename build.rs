//! Build script for appwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `appwall --version`.

fn main() {
    // Re-run build if the privileged binary overrides change
    println!("cargo:rerun-if-env-changed=APPWALL_SU_COMMAND");
    println!("cargo:rerun-if-env-changed=APPWALL_BROKER_COMMAND");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
