// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Builds the `/bin/sh -c` wrapper that prepares the container filesystem
//! and then executes the caller's command. Script bodies travel base64-
//! encoded inside the wrapper so arbitrary content survives shell quoting.

use super::ContainerJob;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::borrow::Cow;
use std::fmt::Write;

/// Quotes a word for POSIX sh when it contains anything shell-special.
fn shell_quote(word: &str) -> Cow<'_, str> {
    shell_words::quote(word)
}

pub fn build_wrapper_script(job: &ContainerJob) -> String {
    let mut script = String::new();
    let _ = writeln!(&mut script, "set -e");

    for dir in &job.ensure_dirs {
        let _ = writeln!(&mut script, "mkdir -p {}", shell_quote(dir));
    }

    // Worker images bake dependencies under /worker/node_modules; scripts
    // run out of /tmp and expect resolution to work from there.
    let _ = writeln!(
        &mut script,
        "if [ -d /worker/node_modules ] && [ ! -e /tmp/node_modules ]; then ln -s /worker/node_modules /tmp/node_modules; fi"
    );

    let file_name = job
        .inline_script_file_name
        .as_deref()
        .expect("validated before script assembly");
    let script_path = format!("/tmp/{file_name}");
    if let Some(content) = &job.inline_script_content {
        let _ = writeln!(
            &mut script,
            "echo {} | base64 -d > {}",
            BASE64.encode(content.as_bytes()),
            shell_quote(&script_path)
        );
    }

    for file in &job.additional_files {
        let _ = writeln!(
            &mut script,
            "mkdir -p {}",
            shell_quote(parent_dir(&file.target_path))
        );
        let _ = writeln!(
            &mut script,
            "echo {} | base64 -d > {}",
            BASE64.encode(file.content.as_bytes()),
            shell_quote(&file.target_path)
        );
    }

    let rewritten: Vec<String> = job
        .cmd
        .iter()
        .map(|arg| {
            let arg = arg.replace(file_name, &script_path);
            shell_quote(&arg).into_owned()
        })
        .collect();
    let _ = writeln!(&mut script, "exec {}", rewritten.join(" "));

    script
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::AdditionalFile;
    use test_r::test;

    fn job_with_script(cmd: Vec<&str>, file_name: &str, content: &str) -> ContainerJob {
        let mut job = ContainerJob::new(
            "vantage/worker:latest",
            cmd.into_iter().map(|s| s.to_string()).collect(),
        );
        job.inline_script_content = Some(content.to_string());
        job.inline_script_file_name = Some(file_name.to_string());
        job
    }

    #[test]
    fn command_references_are_rewritten_to_tmp() {
        let job = job_with_script(vec!["k6", "run", "test.js"], "test.js", "export {}");
        let script = build_wrapper_script(&job);
        assert!(script.contains("exec k6 run /tmp/test.js"));
    }

    #[test]
    fn script_content_travels_base64_encoded() {
        let content = "console.log('it\\'s \"quoted\"')";
        let job = job_with_script(vec!["node", "main.js"], "main.js", content);
        let script = build_wrapper_script(&job);
        let encoded = BASE64.encode(content.as_bytes());
        assert!(script.contains(&format!("echo {encoded} | base64 -d > /tmp/main.js")));
        // The raw body never appears in the wrapper.
        assert!(!script.contains("it\\'s"));
    }

    #[test]
    fn shell_special_args_are_quoted() {
        let job = job_with_script(
            vec!["node", "main.js", "--label", "a b; rm -rf /"],
            "main.js",
            "x",
        );
        let script = build_wrapper_script(&job);
        assert!(script.contains("'a b; rm -rf /'"));
    }

    #[test]
    fn ensure_dirs_and_additional_files_are_prepared() {
        let mut job = job_with_script(vec!["node", "main.js"], "main.js", "x");
        job.ensure_dirs = vec!["/tmp/report".to_string()];
        job.additional_files = vec![AdditionalFile {
            content: "{}".to_string(),
            target_path: "/tmp/config/settings.json".to_string(),
        }];
        let script = build_wrapper_script(&job);
        assert!(script.contains("mkdir -p /tmp/report"));
        assert!(script.contains("mkdir -p /tmp/config"));
        assert!(script.contains("> /tmp/config/settings.json"));
    }

    #[test]
    fn node_modules_symlink_is_conditional() {
        let job = job_with_script(vec!["node", "main.js"], "main.js", "x");
        let script = build_wrapper_script(&job);
        assert!(script.contains("[ -d /worker/node_modules ]"));
        assert!(script.contains("ln -s /worker/node_modules /tmp/node_modules"));
    }
}
