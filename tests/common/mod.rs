#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Stand-in for `ansible-playbook`. Pulls `host_id`, `host_variable_file`
/// and `fail_dir` out of the extra vars, fails when `<fail_dir>/<host_id>`
/// exists, and otherwise checks the payload file is in place.
const FAKE_PLAYBOOK: &str = r#"#!/bin/sh
vars=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--extra-vars" ]; then
    vars="$2"
    shift
  fi
  shift
done
field() {
  printf '%s' "$vars" | sed -n "s/.*\"$1\":\"\([^\"]*\)\".*/\1/p"
}
host=$(field host_id)
file=$(field host_variable_file)
fail_dir=$(field fail_dir)
if [ -n "$fail_dir" ] && [ -e "$fail_dir/$host" ]; then
  echo "fatal: [$host]: UNREACHABLE!" >&2
  exit 4
fi
if [ ! -f "$file" ]; then
  echo "missing variable file $file" >&2
  exit 2
fi
echo "ok: [$host]"
"#;

pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("fail")).unwrap();
        let script = dir.path().join("fake-playbook");
        std::fs::write(&script, FAKE_PLAYBOOK).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn playbook(&self) -> PathBuf {
        self.path("fake-playbook")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path("state")
    }

    pub fn fail_dir(&self) -> PathBuf {
        self.path("fail")
    }

    pub fn stat_file(&self) -> PathBuf {
        self.path("healthcheck_stat")
    }

    pub fn inventory_file(&self) -> PathBuf {
        self.path("hosts.json")
    }

    pub fn set_inventory(&self, doc: serde_json::Value) {
        std::fs::write(self.inventory_file(), doc.to_string()).unwrap();
    }

    pub fn fail_host(&self, id: &str) {
        std::fs::write(self.fail_dir().join(id), b"").unwrap();
    }

    pub fn heal_host(&self, id: &str) {
        std::fs::remove_file(self.fail_dir().join(id)).unwrap();
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir().join(name)
    }

    /// Agent config in YAML pointing at this sandbox.
    pub fn config_yaml(&self, extra: &str) -> String {
        format!(
            "log_format: text\n\
             collect_interval_seconds: 1\n\
             healthcheck_threshold_seconds: 60\n\
             healthcheck_stat_file: {stat}\n\
             output_directory: {state}\n\
             inventory:\n  kind: file\n  path: {inventory}\n\
             ansible:\n  binary: {playbook}\n  playbooks: [site.yml]\n  extra_vars:\n    fail_dir: {fail}\n\
             {extra}",
            stat = self.stat_file().display(),
            state = self.state_dir().display(),
            inventory = self.inventory_file().display(),
            playbook = self.playbook().display(),
            fail = self.fail_dir().display(),
        )
    }

    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.path("config.yml");
        std::fs::write(&path, self.config_yaml(extra)).unwrap();
        path
    }
}
