pub mod args;
pub mod invoker;
pub mod result;

pub use args::{
    CONTAINER_PREFIX, GUEST_INSTRUCTIONS_PATH, RunRequest, SandboxProfile, build_run_args,
    container_matches_task, container_name,
};
pub use invoker::{AgentInvoker, DockerInvoker, SandboxError, TurnOutput};
pub use result::{AgentResult, AgentUsage, parse_stdout, salvage_session_id};
