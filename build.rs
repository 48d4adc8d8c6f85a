use chrono::{SecondsFormat, Utc};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    println!("cargo:rustc-env=BUILD_DATE={}", stamp);
}
