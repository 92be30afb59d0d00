// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatcher actions: what happens to a matched product.
//!
//! Three action kinds, validated syntactically at table load:
//!
//! - `FILE path` -- append the product data to a file (`-overwrite`
//!   truncates first, `-flush` fsyncs after)
//! - `PIPE command args...` -- spawn the command and write the product
//!   data to its stdin
//! - `EXEC command args...` -- spawn the command; the product data is not
//!   passed, only substitutions
//!
//! Arguments may reference capture groups of the matching pattern as
//! `$1`..`$9` and the product identity as `$ident`.

use crate::process::spawn;
use crate::product::ProductInfo;
use regex::Captures;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::process::Stdio;

/// A parsed, validated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    File {
        path: String,
        overwrite: bool,
        flush: bool,
    },
    Pipe {
        command: Vec<String>,
    },
    Exec {
        command: Vec<String>,
    },
}

impl Action {
    /// Parse the action part of a table line.
    pub fn parse(kind: &str, args: &[&str]) -> Result<Action, String> {
        match kind.to_ascii_uppercase().as_str() {
            "FILE" => {
                let mut overwrite = false;
                let mut flush = false;
                let mut path = None;
                for arg in args {
                    match *arg {
                        "-overwrite" => overwrite = true,
                        "-flush" => flush = true,
                        other if other.starts_with('-') => {
                            return Err(format!("unknown FILE option {other}"));
                        }
                        other => {
                            if path.replace(other.to_string()).is_some() {
                                return Err("FILE takes exactly one path".to_string());
                            }
                        }
                    }
                }
                let path = path.ok_or("FILE needs a path")?;
                Ok(Action::File {
                    path,
                    overwrite,
                    flush,
                })
            }
            "PIPE" => {
                if args.is_empty() {
                    return Err("PIPE needs a command".to_string());
                }
                Ok(Action::Pipe {
                    command: args.iter().map(|s| (*s).to_string()).collect(),
                })
            }
            "EXEC" => {
                if args.is_empty() {
                    return Err("EXEC needs a command".to_string());
                }
                Ok(Action::Exec {
                    command: args.iter().map(|s| (*s).to_string()).collect(),
                })
            }
            other => Err(format!("unknown action {other}")),
        }
    }

    /// Run the action for one product. `captures` comes from the rule's
    /// pattern match against the identity.
    pub fn execute(
        &self,
        info: &ProductInfo,
        data: &[u8],
        captures: &Captures<'_>,
    ) -> io::Result<()> {
        match self {
            Action::File {
                path,
                overwrite,
                flush,
            } => {
                let path = substitute(path, info, captures);
                let mut opts = OpenOptions::new();
                opts.create(true).write(true);
                if *overwrite {
                    opts.truncate(true);
                } else {
                    opts.append(true);
                }
                let mut file = opts.open(&path)?;
                file.write_all(data)?;
                if *flush {
                    file.sync_data()?;
                }
                log::debug!("FILE {}: {} bytes", path, data.len());
                Ok(())
            }
            Action::Pipe { command } => {
                let argv = substitute_all(command, info, captures);
                let mut child = spawn::command(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::piped())
                    .spawn()?;
                if let Some(stdin) = child.stdin.as_mut() {
                    stdin.write_all(data)?;
                }
                drop(child.stdin.take());
                let status = child.wait()?;
                if !status.success() {
                    log::warn!("PIPE {} exited with {status}", argv[0]);
                }
                Ok(())
            }
            Action::Exec { command } => {
                let argv = substitute_all(command, info, captures);
                let status = spawn::command(&argv[0]).args(&argv[1..]).status()?;
                if !status.success() {
                    log::warn!("EXEC {} exited with {status}", argv[0]);
                }
                Ok(())
            }
        }
    }
}

fn substitute_all(args: &[String], info: &ProductInfo, captures: &Captures<'_>) -> Vec<String> {
    args.iter().map(|a| substitute(a, info, captures)).collect()
}

/// Replace `$ident` and `$1`..`$9` in an argument.
fn substitute(arg: &str, info: &ProductInfo, captures: &Captures<'_>) -> String {
    let mut out = String::with_capacity(arg.len());
    let bytes = arg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next.is_ascii_digit() && next != b'0' {
                let group = (next - b'0') as usize;
                if let Some(m) = captures.get(group) {
                    out.push_str(m.as_str());
                }
                i += 2;
                continue;
            }
            if arg[i + 1..].starts_with("ident") {
                out.push_str(&info.ident);
                i += 1 + "ident".len();
                continue;
            }
        }
        // Walk a full UTF-8 character, not a byte.
        let ch = arg[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{Feedtype, Product};
    use regex::Regex;

    fn sample() -> Product {
        Product::new(Feedtype::TEXT, "SAUS44 KOKC", "h", 0, b"observation".to_vec())
    }

    #[test]
    fn test_parse_file_options() {
        let a = Action::parse("FILE", &["-overwrite", "/tmp/out.dat"]).expect("parse");
        assert_eq!(
            a,
            Action::File {
                path: "/tmp/out.dat".to_string(),
                overwrite: true,
                flush: false
            }
        );
        assert!(Action::parse("FILE", &[]).is_err());
        assert!(Action::parse("FILE", &["-bogus", "p"]).is_err());
        assert!(Action::parse("FILE", &["a", "b"]).is_err());
    }

    #[test]
    fn test_parse_pipe_exec() {
        assert!(Action::parse("PIPE", &["cat"]).is_ok());
        assert!(Action::parse("PIPE", &[]).is_err());
        assert!(Action::parse("exec", &["/bin/true"]).is_ok(), "case-insensitive");
        assert!(Action::parse("SPLICE", &["x"]).is_err());
    }

    #[test]
    fn test_substitution() {
        let p = sample();
        let re = Regex::new(r"^(\w+) (\w+)$").expect("regex");
        let caps = re.captures(&p.info.ident).expect("captures");
        assert_eq!(substitute("/data/$1/$2.txt", &p.info, &caps), "/data/SAUS44/KOKC.txt");
        assert_eq!(substitute("$ident", &p.info, &caps), "SAUS44 KOKC");
        assert_eq!(substitute("plain", &p.info, &caps), "plain");
        assert_eq!(substitute("$9", &p.info, &caps), "", "absent group is empty");
    }

    #[test]
    fn test_file_action_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.dat");
        let p = sample();
        let re = Regex::new(".*").expect("regex");
        let caps = re.captures(&p.info.ident).expect("captures");

        let action = Action::File {
            path: path.to_string_lossy().to_string(),
            overwrite: false,
            flush: true,
        };
        action.execute(&p.info, &p.data, &caps).expect("run");
        action.execute(&p.info, &p.data, &caps).expect("run again");
        let written = std::fs::read(&path).expect("read");
        assert_eq!(written.len(), p.data.len() * 2, "append mode");

        let overwrite = Action::File {
            path: path.to_string_lossy().to_string(),
            overwrite: true,
            flush: false,
        };
        overwrite.execute(&p.info, &p.data, &caps).expect("run");
        assert_eq!(std::fs::read(&path).expect("read").len(), p.data.len());
    }

    #[test]
    fn test_pipe_action_feeds_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("piped.txt");
        let p = sample();
        let re = Regex::new(".*").expect("regex");
        let caps = re.captures(&p.info.ident).expect("captures");

        let action = Action::Pipe {
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("cat > {}", out.display()),
            ],
        };
        action.execute(&p.info, &p.data, &caps).expect("run");
        assert_eq!(std::fs::read(&out).expect("read"), p.data);
    }
}
