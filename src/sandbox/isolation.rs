//! The container isolation profile.
//!
//! Every control below is applied on every run. Dropping any one of them is a
//! security regression, so the argument vector is built in one place and
//! shared by real executions and version probes.

use crate::config::ExecutionOptions;

/// Unprivileged, unmapped user (`nobody:nogroup` on Debian images).
const SANDBOX_USER: &str = "65534:65534";

/// Writable scratch mounts; the root filesystem itself is read-only.
const TMPFS_MOUNTS: [&str; 2] = ["/tmp:rw,size=64m", "/var/tmp:rw,size=16m"];

/// Resource ceilings and image for a container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationProfile {
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

impl IsolationProfile {
    pub fn from_options(options: &ExecutionOptions) -> Self {
        Self {
            image: options.image.clone(),
            memory: options.memory.clone(),
            cpus: options.cpus.clone(),
            pids_limit: options.pids_limit,
        }
    }

    /// Engine arguments for `<engine> run ...` under this profile.
    ///
    /// `name` must be unique per invocation; it is the handle the timeout
    /// path kills. With `interactive`, the container's stdin is attached.
    pub fn run_args(&self, name: &str, interactive: bool, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = ["run", "--name", name, "--rm"]
            .into_iter()
            .map(String::from)
            .collect();
        if interactive {
            args.push("-i".into());
        }

        let pids_limit = self.pids_limit.to_string();
        let locked_down = [
            "--pull=never",
            "--network",
            "none",
            "--pids-limit",
            pids_limit.as_str(),
            "--memory",
            self.memory.as_str(),
            "--cpus",
            self.cpus.as_str(),
            "--read-only",
            "--tmpfs",
            TMPFS_MOUNTS[0],
            "--tmpfs",
            TMPFS_MOUNTS[1],
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--user",
            SANDBOX_USER,
            "--workdir",
            "/tmp",
        ];
        args.extend(locked_down.into_iter().map(String::from));

        args.push(self.image.clone());
        args.extend(command.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|pair| pair[0] == flag)
            .map(|pair| pair[1].as_str())
            .collect()
    }

    #[test]
    fn applies_every_isolation_control() {
        let profile = IsolationProfile::from_options(&ExecutionOptions::default());
        let args = profile.run_args("perlcode-exec-1", true, &["perl".into(), "-".into()]);

        assert_eq!(args[0], "run");
        assert_eq!(flag_value(&args, "--name"), ["perlcode-exec-1"]);
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"--pull=never".to_string()));
        assert_eq!(flag_value(&args, "--network"), ["none"]);
        assert_eq!(flag_value(&args, "--pids-limit"), ["64"]);
        assert_eq!(flag_value(&args, "--memory"), ["256m"]);
        assert_eq!(flag_value(&args, "--cpus"), ["1"]);
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(
            flag_value(&args, "--tmpfs"),
            ["/tmp:rw,size=64m", "/var/tmp:rw,size=16m"]
        );
        assert_eq!(flag_value(&args, "--cap-drop"), ["ALL"]);
        assert_eq!(flag_value(&args, "--security-opt"), ["no-new-privileges"]);
        assert_eq!(flag_value(&args, "--user"), ["65534:65534"]);
    }

    #[test]
    fn image_precedes_the_interpreter_command() {
        let profile = IsolationProfile::from_options(&ExecutionOptions::default());
        let args = profile.run_args("n", false, &["perl".into(), "-e".into(), "print $^V".into()]);

        assert!(!args.contains(&"-i".to_string()));
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, ["perl:5.38-slim", "perl", "-e", "print $^V"]);
    }

    #[test]
    fn uses_configured_limits() {
        let options = ExecutionOptions {
            memory: "128m".into(),
            cpus: "0.5".into(),
            pids_limit: 16,
            image: "perl:5.40".into(),
            ..ExecutionOptions::default()
        };
        let args = IsolationProfile::from_options(&options).run_args("n", true, &[]);

        assert_eq!(flag_value(&args, "--memory"), ["128m"]);
        assert_eq!(flag_value(&args, "--cpus"), ["0.5"]);
        assert_eq!(flag_value(&args, "--pids-limit"), ["16"]);
        assert_eq!(args.last().map(String::as_str), Some("perl:5.40"));
    }
}
