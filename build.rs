// Copyright 2023, The Android Open Source Project
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

//! Generate PDL backend for NCI packets

use std::env;
use std::path::{Path, PathBuf};

fn main() {
    install_generated_module(
        "nci_packets.rs",
        "NCI_PACKETS_PREBUILT",
        &PathBuf::from("src/nci_packets.pdl").canonicalize().unwrap(),
    );
}

fn install_generated_module(module_name: &str, prebuilt_var: &str, pdl_name: &PathBuf) {
    println!("cargo:rerun-if-env-changed={}", prebuilt_var);
    let module_prebuilt = match env::var(prebuilt_var) {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from(module_name),
    };

    if Path::new(module_prebuilt.as_os_str()).exists() {
        let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::copy(
            module_prebuilt.as_os_str().to_str().unwrap(),
            out_dir.join(module_name).as_os_str().to_str().unwrap(),
        )
        .unwrap();
    } else {
        generate_module(pdl_name);
    }
}

fn generate_module(in_file: &PathBuf) {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_file = out_dir.join(in_file.file_name().unwrap()).with_extension("rs");

    println!("cargo:rerun-if-changed={}", in_file.display());
    let mut sources = pdl_compiler::ast::SourceDatabase::new();
    let file = pdl_compiler::parser::parse_file(&mut sources, in_file.to_str().unwrap())
        .unwrap_or_else(|_| panic!("failed to parse {}", in_file.display()));
    let file = pdl_compiler::analyzer::analyze(&file)
        .unwrap_or_else(|_| panic!("failed to analyze {}", in_file.display()));

    std::fs::write(out_file, pdl_compiler::backends::rust::generate(&sources, &file)).unwrap();
}
