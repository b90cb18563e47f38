// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Stamps build metadata into the binary. Release pipelines set the BUILD_* variables; local
// builds fall back to the package version.
fn main() -> Result<(), anyhow::Error> {
    let package_version = std::env::var("CARGO_PKG_VERSION")?;
    let stamped = [
        ("buildVersion", "BUILD_VERSION", package_version.as_str()),
        ("buildGitRevision", "BUILD_GIT_REVISION", "unknown"),
        ("buildStatus", "BUILD_STATUS", "unknown"),
        ("buildTag", "BUILD_TAG", "unknown"),
    ];
    for (key, var, default) in stamped {
        println!("cargo:rerun-if-env-changed={var}");
        let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
        println!("cargo:rustc-env=AUTHN_K8S_BUILD_{key}={value}");
    }
    println!(
        "cargo:rustc-env=AUTHN_K8S_BUILD_RUSTC_VERSION={}",
        rustc_version::version()?
    );
    Ok(())
}
