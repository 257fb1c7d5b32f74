//! Build script for llamalink test fixtures
//!
//! Compiles small C shared libraries that stand in for llama.cpp builds,
//! using the C compiler the `cc` crate selects for the target. Output goes
//! to `$OUT_DIR/fixtures`, exported as `LLAMALINK_FIXTURE_DIR`:
//!
//! ```text
//! cpu/      libllama + libggml-base, no CUDA entry point
//! gpu/      libllama with ggml_backend_cuda_init + libggml-base
//! broken/   a non-library file and a library with a deleted dependency
//! structs/  struct-by-value functions for call plan tests
//! ```
//!
//! Fixtures are Unix-only. When no compiler is available the directory is
//! left empty, `LLAMALINK_FIXTURES_BUILT` is `0` and the tests that need it
//! skip. Once a compiler runs, a fixture that fails to build fails the build
//! and `LLAMALINK_FIXTURES_BUILT` is `1`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let fixture_dir = out_dir.join("fixtures");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=fixtures/");
    println!("cargo:rustc-env=LLAMALINK_FIXTURE_DIR={}", fixture_dir.display());

    if fixture_dir.exists() {
        let _ = fs::remove_dir_all(&fixture_dir);
    }
    fs::create_dir_all(&fixture_dir).expect("Failed to create fixture directory");

    if env::var("CARGO_CFG_TARGET_FAMILY").as_deref() != Ok("unix") {
        println!("cargo:rustc-env=LLAMALINK_FIXTURES_BUILT=0");
        return;
    }

    let compiler = match cc::Build::new()
        .cargo_metadata(false)
        .warnings(false)
        .try_get_compiler()
    {
        Ok(compiler) => compiler,
        Err(e) => {
            println!(
                "cargo:warning=No C compiler for test fixtures ({}); native tests will skip",
                e
            );
            println!("cargo:rustc-env=LLAMALINK_FIXTURES_BUILT=0");
            return;
        }
    };

    if let Err(e) = compiler.to_command().arg("--version").output() {
        println!(
            "cargo:warning=C compiler {} does not run ({}); native tests will skip",
            compiler.path().display(),
            e
        );
        println!("cargo:rustc-env=LLAMALINK_FIXTURES_BUILT=0");
        return;
    }

    let fixtures = Fixtures {
        compiler,
        src: PathBuf::from("fixtures"),
        out: fixture_dir.clone(),
        ext: if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
            "dylib"
        } else {
            "so"
        },
    };

    if let Err(e) = fixtures.build_all() {
        panic!("Failed to build test fixtures in {}: {}", fixture_dir.display(), e);
    }
    println!("cargo:rustc-env=LLAMALINK_FIXTURES_BUILT=1");
}

struct Fixtures {
    compiler: cc::Tool,
    src: PathBuf,
    out: PathBuf,
    ext: &'static str,
}

impl Fixtures {
    fn build_all(&self) -> Result<(), String> {
        for (variant, defines) in [("cpu", &[][..]), ("gpu", &["FIXTURE_GPU"][..])] {
            self.shared("llama_stub.c", variant, "llama", defines, &[])?;
            self.shared("ggml_base_stub.c", variant, "ggml-base", &[], &[])?;
        }

        self.shared("structs.c", "structs", "structs", &[], &[])?;

        // A file that exists but is not a loadable module.
        let broken_dir = self.variant_dir("broken")?;
        let garbage = self.lib_path("broken", "garbage");
        fs::write(&garbage, b"this is not a shared library\n")
            .map_err(|e| format!("{}: {}", garbage.display(), e))?;

        // A library whose dependency is removed after linking.
        let dep = self.shared("dep.c", "broken", "fixture_dep", &[], &[])?;
        let link_args = [
            format!("-L{}", broken_dir.display()),
            "-lfixture_dep".to_string(),
        ];
        self.shared("needs_dep.c", "broken", "needs_dep", &[], &link_args)?;
        fs::remove_file(&dep).map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Create `<out>/<variant>` if needed.
    fn variant_dir(&self, variant: &str) -> Result<PathBuf, String> {
        let dir = self.out.join(variant);
        fs::create_dir_all(&dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
        Ok(dir)
    }

    fn lib_path(&self, variant: &str, name: &str) -> PathBuf {
        self.out.join(variant).join(format!("lib{}.{}", name, self.ext))
    }

    /// Compile one C file into `<variant>/lib<name>.<ext>`.
    fn shared(
        &self,
        source: &str,
        variant: &str,
        name: &str,
        defines: &[&str],
        link_args: &[String],
    ) -> Result<PathBuf, String> {
        self.variant_dir(variant)?;
        let output = self.lib_path(variant, name);
        let input = self.src.join(source);
        println!("cargo:rerun-if-changed={}", input.display());

        let mut cmd: Command = self.compiler.to_command();
        cmd.args(["-shared", "-fPIC", "-O1", "-o"]).arg(&output).arg(&input);
        for define in defines {
            cmd.arg(format!("-D{}", define));
        }
        cmd.args(link_args);
        run(cmd, &output)?;
        Ok(output)
    }
}

fn run(mut cmd: Command, output: &Path) -> Result<(), String> {
    let result = cmd
        .output()
        .map_err(|e| format!("failed to run compiler for {}: {}", output.display(), e))?;
    if !result.status.success() {
        return Err(format!(
            "compiler failed for {}: {}",
            output.display(),
            String::from_utf8_lossy(&result.stderr)
        ));
    }
    Ok(())
}
