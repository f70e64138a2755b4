//! Shared fixtures for syncreeper integration tests
//!
//! Remotes are real bare repositories on disk, addressed with `file://` URLs,
//! so reconciliation runs the same git commands it runs against GitHub.
#![allow(dead_code)]

use assert_fs::TempDir;
use std::path::{Path, PathBuf};
use std::process::Command;
use syncreeper::Repository;

pub const BRANCH: &str = "main";
pub const TOKEN: &str = "ghp_integrationtesttoken";

/// Run git in `dir`, panicking with stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=syncreeper-test", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("git is installed");

    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare "origin" plus a working clone used to push new commits into it
pub struct TestRemote {
    pub owner: String,
    pub name: String,
    pub bare: PathBuf,
    work: PathBuf,
    commits: usize,
}

impl TestRemote {
    /// Create `<base>/remotes/<owner>/<name>.git` with one commit on `main`
    pub fn new(base: &Path, owner: &str, name: &str) -> Self {
        let bare = base.join("remotes").join(owner).join(format!("{}.git", name));
        let work = base.join("work").join(owner).join(name);
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        git(&bare, &["init", "--bare", "--quiet"]);
        git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(&work, &["init", "--quiet"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);

        let mut remote = Self {
            owner: owner.to_string(),
            name: name.to_string(),
            bare,
            work,
            commits: 0,
        };
        remote.commit("README.md", &format!("# {}\n", name));
        remote
    }

    /// Commit `contents` to `file` and push it to the bare origin
    pub fn commit(&mut self, file: &str, contents: &str) {
        self.commits += 1;
        std::fs::write(self.work.join(file), contents).unwrap();
        git(&self.work, &["add", file]);
        git(&self.work, &["commit", "--quiet", "-m", &format!("commit {}", self.commits)]);
        git(&self.work, &["push", "--quiet", "origin", BRANCH]);
    }

    pub fn url(&self) -> String {
        url::Url::from_file_path(&self.bare).unwrap().to_string()
    }

    pub fn head(&self) -> String {
        git(&self.bare, &["rev-parse", "refs/heads/main"])
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn repository(&self) -> Repository {
        repository(&self.owner, &self.name, &self.url())
    }
}

pub fn repository(owner: &str, name: &str, clone_url: &str) -> Repository {
    Repository {
        name: name.to_string(),
        full_name: format!("{}/{}", owner, name),
        clone_url: clone_url.to_string(),
        ssh_url: None,
        is_private: false,
        is_archived: false,
        default_branch: BRANCH.to_string(),
    }
}

/// Temp workspace holding remotes and a mirror root
pub struct Workspace {
    pub temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.temp.path().join("mirrors")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.temp.path().join("locks")
    }

    pub fn remote(&self, owner: &str, name: &str) -> TestRemote {
        TestRemote::new(self.temp.path(), owner, name)
    }

    pub fn mirror_path(&self, remote: &TestRemote) -> PathBuf {
        self.mirror_root().join(&remote.owner).join(&remote.name)
    }
}

/// HEAD commit of a mirror
pub fn mirror_head(mirror: &Path) -> String {
    git(mirror, &["rev-parse", "HEAD"])
}

/// Every URL configured for `origin` in the mirror's git config
pub fn origin_url(mirror: &Path) -> String {
    git(mirror, &["config", "--get", "remote.origin.url"])
}

/// Port of a TCP listener that accepts connections and never answers.
///
/// Git talking to it hangs until the caller gives up.
pub fn silent_listener() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    port
}

/// Make git resolve `https://<credential>@<host>/` to the bare remotes on disk.
///
/// Set through `GIT_CONFIG_*` so the reconciler's own git processes pick it
/// up; callers must be `#[serial]`.
pub struct UrlRewrite {
    keys: [&'static str; 3],
}

impl UrlRewrite {
    pub fn install(base: &Path, credential: &str, host: &str) -> Self {
        let remotes = url::Url::from_directory_path(base.join("remotes")).unwrap();
        std::env::set_var("GIT_CONFIG_COUNT", "1");
        std::env::set_var("GIT_CONFIG_KEY_0", format!("url.{}.insteadOf", remotes));
        std::env::set_var("GIT_CONFIG_VALUE_0", format!("https://{}@{}/", credential, host));
        Self {
            keys: ["GIT_CONFIG_COUNT", "GIT_CONFIG_KEY_0", "GIT_CONFIG_VALUE_0"],
        }
    }
}

impl Drop for UrlRewrite {
    fn drop(&mut self) {
        for key in self.keys {
            std::env::remove_var(key);
        }
    }
}
