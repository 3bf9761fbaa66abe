fn main() {
    tideway::run();
}
