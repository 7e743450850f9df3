use ptyhelperd::server::Server;
use std::path::PathBuf;

fn main() {
  ptyhelperd::logging::init();

  let socket_path = match std::env::args().nth(1) {
    Some(path) => PathBuf::from(path),
    None => {
      eprintln!("usage: ptyhelperd <socket-path>");
      std::process::exit(1);
    }
  };

  let code = Server::bootstrap_and_run(socket_path);
  std::process::exit(code);
}
