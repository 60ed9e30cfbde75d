fn main() {
    gamehost_lib::run();
}
