use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(about = "Layered copy-on-write mounts over a shared read-only base")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount one job in the foreground until interrupted")]
    Serve {
        #[arg(help = "Job identifier")]
        job_id: String,
        #[arg(long, help = "Directory served as the read-only base layer")]
        base: PathBuf,
        #[arg(long, help = "Mount point (defaults to <mount_root>/<job_id>)")]
        mount: Option<PathBuf>,
        #[arg(long, help = "Shared changelist layer to attach")]
        changelist: Option<String>,
    },
    #[command(about = "Print the recorded mounts as JSON")]
    List,
    #[command(
        about = "Unmount a job and delete its upper layer",
        long_about = "Unmount a job and delete its upper layer.\n\n\
            Needs exclusive ownership of the registry state file, so it fails \
            while a `canopy serve` process is running. Stop the server first."
    )]
    Remove {
        #[arg(help = "Job identifier")]
        job_id: String,
    },
    #[command(
        about = "Protect a job from removal",
        long_about = "Protect a job from removal.\n\n\
            Needs exclusive ownership of the registry state file, so it fails \
            while a `canopy serve` process is running. Stop the server first."
    )]
    Lock {
        #[arg(help = "Job identifier")]
        job_id: String,
    },
    #[command(
        about = "Allow a job to be removed again",
        long_about = "Allow a job to be removed again.\n\n\
            Needs exclusive ownership of the registry state file, so it fails \
            while a `canopy serve` process is running. Stop the server first."
    )]
    Unlock {
        #[arg(help = "Job identifier")]
        job_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_arguments() {
        let args = Args::try_parse_from([
            "canopy",
            "serve",
            "job-7",
            "--base",
            "/srv/base",
            "--changelist",
            "cl-1",
        ])
        .unwrap();
        match args.command {
            Commands::Serve {
                job_id,
                base,
                mount,
                changelist,
            } => {
                assert_eq!(job_id, "job-7");
                assert_eq!(base, PathBuf::from("/srv/base"));
                assert!(mount.is_none());
                assert_eq!(changelist.as_deref(), Some("cl-1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_state_mutating_commands_document_the_serve_conflict() {
        use clap::CommandFactory;

        let mut command = Args::command();
        for name in ["remove", "lock", "unlock"] {
            let help = command
                .find_subcommand_mut(name)
                .unwrap()
                .render_long_help()
                .to_string();
            assert!(help.contains("`canopy serve`"), "{}: {}", name, help);
        }
    }

    #[test]
    fn test_serve_requires_base() {
        assert!(Args::try_parse_from(["canopy", "serve", "job-7"]).is_err());
    }
}
