use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        io_uring: { all(target_os = "linux", feature = "io-uring") },
        epoll_like: { any(target_os = "linux", target_os = "android") },
        kqueue_like: { any(
            target_os = "macos",
            target_os = "ios",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ) },
    }
}
