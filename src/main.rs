fn main() {
    if let Err(e) = officechat_lib::run() {
        eprintln!("officechat: {:#}", e);
        std::process::exit(1);
    }
}
