fn main() {
    if let Err(err) = blocktree_node::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
