fn main() {
    fieldgate::run()
}
