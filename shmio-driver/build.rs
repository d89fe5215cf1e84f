use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        datasync: { any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "linux",
            target_os = "netbsd"
        ) },
        io_uring: { all(target_os = "linux", feature = "io-uring") },
        posix_aio: { all(unix, not(target_os = "macos"), feature = "posix-aio") },
    }
}
