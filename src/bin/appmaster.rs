fn main() -> anyhow::Result<()> {
    appmaster::am::main()
}
