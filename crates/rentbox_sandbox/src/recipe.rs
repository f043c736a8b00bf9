//! Build recipes, one per [`Language`].

use rentbox_core::prelude::*;

use regex::Regex;
use std::sync::LazyLock;

pub const MAX_DEPENDENCIES: usize = 64;
const MAX_DEPENDENCY_LEN: usize = 128;

/// Directory inside the image the renter's program lives and runs in.
pub const WORKDIR: &str = "/sandbox";

/// How to build and run programs of one language.
#[derive(Debug)]
pub struct Recipe {
    pub language: Language,
    /// Runtime image every base image starts from.
    pub runtime_image: &'static str,
    /// File name the renter's source is stored as.
    pub source_file: &'static str,
    /// Package manager invocation; dependency names are appended.
    pub install: &'static [&'static str],
    pub run: &'static [&'static str],
    pub env: &'static [(&'static str, &'static str)],
    dependency_pattern: &'static LazyLock<Regex>,
}

static PYTHON_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9._-]*(\[[A-Za-z0-9._,-]+\])?((==|>=|<=|~=|!=|>|<)[A-Za-z0-9.*+!-]+)?$",
    )
    .expect("python package pattern is valid")
});

static NPM_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9][a-z0-9._~-]*/)?[a-z0-9][a-z0-9._~-]*(@[A-Za-z0-9.^~<>=*+-]+)?$")
        .expect("npm package pattern is valid")
});

static PYTHON: Recipe = Recipe {
    language: Language::Python,
    runtime_image: "python:3.12-slim",
    source_file: "main.py",
    install: &[
        "pip",
        "install",
        "--no-cache-dir",
        "--disable-pip-version-check",
    ],
    run: &["python", "-u", "main.py"],
    env: &[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")],
    dependency_pattern: &PYTHON_PACKAGE,
};

static JAVASCRIPT: Recipe = Recipe {
    language: Language::JavaScript,
    runtime_image: "node:20-slim",
    source_file: "main.js",
    install: &["npm", "install", "--no-audit", "--no-fund"],
    run: &["node", "main.js"],
    env: &[("NODE_ENV", "production")],
    dependency_pattern: &NPM_PACKAGE,
};

/// The recipe registry. Exhaustive, so a new [`Language`] does not compile without one.
pub fn recipe(language: Language) -> &'static Recipe {
    match language {
        Language::Python => &PYTHON,
        Language::JavaScript => &JAVASCRIPT,
    }
}

impl Recipe {
    /// Rejects anything that is not a plain package specifier before it reaches a build.
    pub fn validate_dependencies(&self, dependencies: &[String]) -> Result<(), BuildError> {
        if dependencies.len() > MAX_DEPENDENCIES {
            return Err(BuildError::DependencyResolution(format!(
                "at most {MAX_DEPENDENCIES} dependencies are allowed, got {}",
                dependencies.len()
            )));
        }

        for dep in dependencies.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
            if dep.len() > MAX_DEPENDENCY_LEN || !self.dependency_pattern.is_match(dep) {
                return Err(BuildError::DependencyResolution(format!(
                    "'{dep}' is not a valid {} package name",
                    self.language
                )));
            }
        }

        Ok(())
    }

    /// Dockerfile of the cached base image: runtime plus installed dependencies.
    ///
    /// `dependencies` must already be normalized and validated.
    pub fn base_dockerfile(&self, dependencies: &[String]) -> String {
        let mut lines = vec![format!("FROM {}", self.runtime_image)];
        for (key, value) in self.env {
            lines.push(format!("ENV {key}={value}"));
        }
        lines.push(format!("WORKDIR {WORKDIR}"));

        if !dependencies.is_empty() {
            let mut cmd: Vec<&str> = self.install.to_vec();
            cmd.extend(dependencies.iter().map(String::as_str));
            lines.push(format!("RUN {}", exec_form(&cmd)));
        }

        lines.join("\n") + "\n"
    }

    /// Dockerfile of a per-job image: the base image plus the renter's source.
    pub fn job_dockerfile(&self, base_tag: &str) -> String {
        [
            format!("FROM {base_tag}"),
            format!("WORKDIR {WORKDIR}"),
            format!("COPY {0} {WORKDIR}/{0}", self.source_file),
            format!("CMD {}", exec_form(self.run)),
        ]
        .join("\n")
            + "\n"
    }
}

/// JSON array form, so no shell ever interprets the arguments.
fn exec_form(args: &[&str]) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| "[]".to_string())
}
